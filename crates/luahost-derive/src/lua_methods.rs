//! `#[lua_methods]`: attribute macro for impl blocks.
//!
//! Re-emits the impl block and adds an inherent
//! `__lua_describe_methods(descriptor)` registering every public method that
//! takes `&self` (shared borrow) or `&mut self` (exclusive borrow).
//! Associated functions, `self` by value, generic and async methods are
//! left out.
//!
//! # Example
//! ```ignore
//! #[lua_methods]
//! impl Point {
//!     pub fn distance(&self) -> f64 {
//!         (self.x * self.x + self.y * self.y).sqrt()
//!     }
//!     pub fn translate(&mut self, dx: f64, dy: f64) {
//!         self.x += dx;
//!         self.y += dy;
//!     }
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{FnArg, ImplItem, ItemImpl, Pat, ReturnType, parse_macro_input};

use crate::derive_userdata::parse_lua_attrs;
use crate::type_utils::{is_result, param_type};

/// Information about a single method to be wrapped.
struct MethodInfo {
    rust_name: syn::Ident,
    lua_name: String,
    is_mut: bool,
    /// Binding name, type read from Lua, and whether the method takes it by
    /// reference.
    params: Vec<(syn::Ident, syn::Type, bool)>,
    return_type: Option<syn::Type>,
}

/// Entry point for `#[lua_methods]`.
pub fn lua_methods_impl(input: TokenStream) -> TokenStream {
    let mut item_impl = parse_macro_input!(input as ItemImpl);
    match expand(&mut item_impl) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(item_impl: &mut ItemImpl) -> syn::Result<TokenStream2> {
    let mut methods = Vec::new();
    for item in &mut item_impl.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        let attr = parse_lua_attrs(&method.attrs)?;
        // `#[lua]` is not a real attribute on methods: drop it before
        // re-emitting.
        method.attrs.retain(|attr| !attr.path().is_ident("lua"));
        if attr.skip || !matches!(method.vis, syn::Visibility::Public(_)) {
            continue;
        }
        if let Some(info) = method_info(&method.sig, attr.name)? {
            methods.push(info);
        }
    }

    let self_ty = &item_impl.self_ty;
    let (impl_generics, _, where_clause) = item_impl.generics.split_for_impl();
    let registrations = methods.iter().map(gen_registration);

    Ok(quote! {
        #item_impl

        impl #impl_generics #self_ty #where_clause {
            #[doc(hidden)]
            #[allow(unused_variables)]
            pub fn __lua_describe_methods(descriptor: &mut luahost::UserDataDescriptor<Self>) {
                #(#registrations)*
            }
        }
    })
}

fn method_info(sig: &syn::Signature, rename: Option<String>) -> syn::Result<Option<MethodInfo>> {
    if sig.asyncness.is_some() || !sig.generics.params.is_empty() {
        return Ok(None);
    }
    let Some(FnArg::Receiver(receiver)) = sig.inputs.first() else {
        return Ok(None);
    };
    if receiver.reference.is_none() {
        return Ok(None);
    }

    let mut params = Vec::new();
    for (i, arg) in sig.inputs.iter().skip(1).enumerate() {
        let FnArg::Typed(pat_type) = arg else {
            continue;
        };
        let binding = match pat_type.pat.as_ref() {
            Pat::Ident(pat_ident) => pat_ident.ident.clone(),
            _ => format_ident!("__arg{}", i),
        };
        let param = param_type(&pat_type.ty)?;
        params.push((binding, param.owned, param.by_ref));
    }

    Ok(Some(MethodInfo {
        lua_name: rename.unwrap_or_else(|| sig.ident.to_string()),
        rust_name: sig.ident.clone(),
        is_mut: receiver.mutability.is_some(),
        params,
        return_type: match &sig.output {
            ReturnType::Default => None,
            ReturnType::Type(_, ty) => Some((**ty).clone()),
        },
    }))
}

fn gen_registration(method: &MethodInfo) -> TokenStream2 {
    let rust_name = &method.rust_name;
    let lua_name = &method.lua_name;
    let names: Vec<_> = method.params.iter().map(|(name, _, _)| name).collect();
    let types: Vec<_> = method.params.iter().map(|(_, ty, _)| ty).collect();
    let call_args = method.params.iter().map(|(name, _, by_ref)| {
        if *by_ref { quote!(&#name) } else { quote!(#name) }
    });

    let call = quote!(this.#rust_name(#(#call_args),*));
    let body = match &method.return_type {
        None => quote! { #call; Ok(()) },
        Some(ty) if is_result(ty) => quote! {
            #call.map_err(::core::convert::Into::<luahost::LuaError>::into)
        },
        Some(_) => quote! { Ok(#call) },
    };

    let (register, this_ty) = if method.is_mut {
        (quote!(add_method_mut), quote!(&mut Self))
    } else {
        (quote!(add_method), quote!(&Self))
    };

    quote! {
        descriptor.#register(#lua_name, |_, this: #this_ty, (#(#names,)*): (#(#types,)*)| {
            #body
        });
    }
}
