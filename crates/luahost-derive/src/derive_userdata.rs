//! `#[derive(LuaUserData)]`: a `LuaUserData` impl built from the struct's
//! public fields.
//!
//! Methods are added by `#[lua_methods]`, which emits an inherent
//! `__lua_describe_methods` that the generated `describe` calls. Without it
//! the call resolves to the empty default of `LuaMethodProvider`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, Meta};

/// Internal field metadata collected during parsing.
struct FieldInfo {
    ident: Ident,
    ty: syn::Type,
    lua_name: String,
    readonly: bool,
}

/// Options of a `#[lua(...)]` attribute.
#[derive(Default)]
pub struct LuaAttr {
    pub skip: bool,
    pub readonly: bool,
    pub name: Option<String>,
}

/// Read every `#[lua(...)]` attribute in `attrs`.
pub fn parse_lua_attrs(attrs: &[Attribute]) -> syn::Result<LuaAttr> {
    let mut parsed = LuaAttr::default();
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("lua")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                parsed.skip = true;
            } else if meta.path.is_ident("readonly") {
                parsed.readonly = true;
            } else if meta.path.is_ident("name") {
                let lit: syn::LitStr = meta.value()?.parse()?;
                parsed.name = Some(lit.value());
            } else {
                return Err(meta.error("expected `skip`, `readonly` or `name = \"...\"`"));
            }
            Ok(())
        })?;
    }
    Ok(parsed)
}

/// Entry point for `#[derive(LuaUserData)]`.
pub fn derive_lua_userdata_impl(input: DeriveInput) -> TokenStream {
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let trait_impls = parse_lua_impl_attrs(input)?;
    let struct_attr = parse_lua_attrs(&input.attrs)?;
    let type_name = struct_attr.name.unwrap_or_else(|| name.to_string());

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => collect_fields(fields)?,
            // Tuple and unit structs expose methods only.
            _ => Vec::new(),
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "LuaUserData can only be derived for structs",
            ));
        }
    };

    let getters = fields.iter().map(|f| {
        let ident = &f.ident;
        let lua_name = &f.lua_name;
        quote! {
            descriptor.add_field_getter(#lua_name, |this: &Self| {
                ::core::clone::Clone::clone(&this.#ident)
            });
        }
    });

    let setters = fields.iter().filter(|f| !f.readonly).map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        let lua_name = &f.lua_name;
        quote! {
            descriptor.add_field_setter(#lua_name, |this: &mut Self, value: #ty| {
                this.#ident = value;
                Ok(())
            });
        }
    });

    let metamethods = gen_metamethods(&trait_impls);
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics luahost::LuaUserData for #name #ty_generics #where_clause {
            fn type_name() -> &'static str {
                #type_name
            }

            fn describe(descriptor: &mut luahost::UserDataDescriptor<Self>) {
                #(#getters)*
                #(#setters)*
                #metamethods
                {
                    #[allow(unused_imports)]
                    use luahost::LuaMethodProvider as _;
                    Self::__lua_describe_methods(descriptor);
                }
            }
        }

        impl #impl_generics luahost::IntoLua for #name #ty_generics #where_clause {
            fn into_lua(self, stack: &luahost::LuaStack<'_>) -> luahost::LuaResult<()> {
                stack.push(::std::rc::Rc::new(::std::cell::RefCell::new(self)))
            }
        }
    })
}

fn collect_fields(fields: &syn::FieldsNamed) -> syn::Result<Vec<FieldInfo>> {
    let mut infos = Vec::new();
    for field in &fields.named {
        let attr = parse_lua_attrs(&field.attrs)?;
        let is_pub = matches!(field.vis, syn::Visibility::Public(_));
        if attr.skip || !is_pub {
            continue;
        }
        let Some(ident) = field.ident.clone() else {
            continue;
        };
        infos.push(FieldInfo {
            lua_name: attr.name.unwrap_or_else(|| ident.to_string()),
            ident,
            ty: field.ty.clone(),
            readonly: attr.readonly,
        });
    }
    Ok(infos)
}

/// Parse `#[lua_impl(Display, PartialEq, PartialOrd, ...)]` attributes.
fn parse_lua_impl_attrs(input: &DeriveInput) -> syn::Result<Vec<String>> {
    let mut impls = Vec::new();
    for attr in &input.attrs {
        if attr.path().is_ident("lua_impl")
            && let Meta::List(list) = &attr.meta
        {
            list.parse_nested_meta(|meta| {
                match meta.path.get_ident().map(Ident::to_string).as_deref() {
                    Some(name @ ("Display" | "PartialEq" | "PartialOrd")) => {
                        impls.push(name.to_owned());
                        Ok(())
                    }
                    _ => Err(meta.error("expected `Display`, `PartialEq` or `PartialOrd`")),
                }
            })?;
        }
    }
    Ok(impls)
}

fn gen_metamethods(trait_impls: &[String]) -> TokenStream2 {
    let has = |name: &str| trait_impls.iter().any(|t| t == name);

    let tostring = has("Display").then(|| {
        quote! {
            descriptor.add_meta_method(luahost::MetaMethod::ToString, |_, this: &Self, ()| {
                Ok(::std::string::ToString::to_string(this))
            });
        }
    });

    // Both operands are userdata when Lua calls `__eq`; one of another type
    // compares unequal.
    let eq = has("PartialEq").then(|| {
        quote! {
            descriptor.add_meta_method(luahost::MetaMethod::Eq, |_, this: &Self, other: luahost::LuaUserDataRef| {
                Ok(other.with(|other: &Self| this == other).unwrap_or(false))
            });
        }
    });

    let ord = has("PartialOrd").then(|| {
        quote! {
            descriptor.add_meta_method(luahost::MetaMethod::Lt, |_, this: &Self, other: luahost::LuaUserDataRef| {
                other.with(|other: &Self| this < other)
            });
            descriptor.add_meta_method(luahost::MetaMethod::Le, |_, this: &Self, other: luahost::LuaUserDataRef| {
                other.with(|other: &Self| this <= other)
            });
        }
    });

    quote! { #tostring #eq #ord }
}
