//! Type inspection shared by both macros.

use syn::{GenericArgument, PathArguments, Type};

/// How a method parameter is read from Lua.
pub struct ParamType {
    /// Type read with `FromLua`.
    pub owned: Type,
    /// Pass `&owned` instead of `owned` to the method.
    pub by_ref: bool,
}

/// `&str` reads as `String`, `&[T]` as `Vec<T>`, other types as themselves.
/// Any other reference is not supported.
pub fn param_type(ty: &Type) -> syn::Result<ParamType> {
    let Type::Reference(reference) = ty else {
        return Ok(ParamType {
            owned: ty.clone(),
            by_ref: false,
        });
    };
    if reference.mutability.is_some() {
        return Err(syn::Error::new_spanned(ty, "`&mut` parameters cannot come from Lua"));
    }
    let owned: Type = match reference.elem.as_ref() {
        Type::Path(path) if path.path.is_ident("str") => syn::parse_quote!(::std::string::String),
        Type::Slice(slice) => {
            let elem = &slice.elem;
            syn::parse_quote!(::std::vec::Vec<#elem>)
        }
        _ => {
            return Err(syn::Error::new_spanned(
                ty,
                "only `&str` and `&[T]` references can come from Lua",
            ));
        }
    };
    Ok(ParamType { owned, by_ref: true })
}

/// Whether `ty` is a `Result<..>`-like type (`Result`, `LuaResult`,
/// `io::Result`, ...), judged by the last path segment.
pub fn is_result(ty: &Type) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    path.path.segments.last().is_some_and(|segment| {
        segment.ident.to_string().ends_with("Result")
            && matches!(&segment.arguments, PathArguments::AngleBracketed(args)
                if args.args.iter().any(|arg| matches!(arg, GenericArgument::Type(_))))
    })
}
