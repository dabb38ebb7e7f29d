//! Proc macros for conduit RPC: `#[derive(Model)]` generates the
//! construction/projection boilerplate a plain struct needs to implement
//! `Model`; `#[derive(ConduitOneof)]` does the same for a `oneof`'s Rust
//! enum.
//!
//! `Model` needs to walk named-field structs, attributes, and generic
//! containers (`Vec<T>`, `BTreeMap<String, T>`) -- exactly the territory
//! `syn::DeriveInput` and `syn::Type` already model, so this crate parses
//! with the full `syn`/`quote`/`proc-macro2` stack rather than a lighter
//! parser (see DESIGN.md).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{
    parse_macro_input, Data, DeriveInput, Expr, ExprLit, Fields, FnArg, GenericArgument, ItemFn, Lit,
    MetaNameValue, PathArguments, ReturnType, Token, Type,
};

// ---------------------------------------------------------------------
// #[derive(Model)]
// ---------------------------------------------------------------------

/// Recognized attributes:
/// - `#[conduit(path = "pkg.Name")]` on the struct (required) -- the schema
///   path §3 and §4.3 key on.
/// - `#[conduit(camel_case)]` on the struct -- sets `Schema::camel_case`.
/// - `#[conduit(bytes)]` on a `Vec<u8>` field -- without it, `Vec<u8>` would
///   be ambiguous with `Repeated<u8>`, which isn't a logical type in §3.
/// - `#[conduit(timestamp)]` on a `conduit_core::Timestamp` field.
/// - `#[conduit(oneof)]` on a field whose type implements `ConduitOneof`
///   (generated by `#[derive(ConduitOneof)]`).
///
/// Every other named field's logical type is inferred from its Rust type:
/// the scalar primitives map directly, `Vec<T>` (other than `#[conduit(bytes)]`)
/// is `Repeated`, `BTreeMap<String, T>`/`HashMap<String, T>` is `Map`, and
/// anything else is treated as a nested message whose schema is `T::schema()`.
///
/// Nested-message construction failures short-circuit the outer
/// `construct` via `?` rather than folding into the combined violation set;
/// top-level scalar/bytes fields are the ones that accumulate every
/// violation before failing, per `RpcError::InvalidArgument`'s contract.
#[proc_macro_derive(Model, attributes(conduit))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_model(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct StructAttrs {
    path: String,
    camel_case: bool,
}

fn parse_struct_attrs(input: &DeriveInput) -> syn::Result<StructAttrs> {
    let mut path = None;
    let mut camel_case = false;
    for attr in &input.attrs {
        if !attr.path().is_ident("conduit") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("path") {
                let lit: Lit = meta.value()?.parse()?;
                match lit {
                    Lit::Str(s) => {
                        path = Some(s.value());
                        Ok(())
                    }
                    _ => Err(meta.error("expected a string literal")),
                }
            } else if meta.path.is_ident("camel_case") {
                camel_case = true;
                Ok(())
            } else {
                Err(meta.error("unrecognized conduit attribute"))
            }
        })?;
    }
    let path = path.ok_or_else(|| {
        syn::Error::new_spanned(&input.ident, "#[derive(Model)] requires #[conduit(path = \"pkg.Name\")]")
    })?;
    Ok(StructAttrs { path, camel_case })
}

enum FieldKind {
    Scalar,
    Bytes,
    Timestamp,
    Oneof,
    Repeated(Box<Type>),
    Map(Box<Type>),
    Message,
}

fn field_attrs(field: &syn::Field) -> syn::Result<(bool, bool, bool)> {
    let (mut is_bytes, mut is_timestamp, mut is_oneof) = (false, false, false);
    for attr in &field.attrs {
        if !attr.path().is_ident("conduit") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("bytes") {
                is_bytes = true;
                Ok(())
            } else if meta.path.is_ident("timestamp") {
                is_timestamp = true;
                Ok(())
            } else if meta.path.is_ident("oneof") {
                is_oneof = true;
                Ok(())
            } else {
                Err(meta.error("unrecognized conduit field attribute"))
            }
        })?;
    }
    Ok((is_bytes, is_timestamp, is_oneof))
}

fn last_segment(ty: &Type) -> Option<&syn::PathSegment> {
    match ty {
        Type::Path(p) => p.path.segments.last(),
        _ => None,
    }
}

fn generic_arg(segment: &syn::PathSegment) -> Option<&Type> {
    match &segment.arguments {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|a| match a {
            GenericArgument::Type(t) => Some(t),
            _ => None,
        }),
        _ => None,
    }
}

fn is_vec_u8(ty: &Type) -> bool {
    last_segment(ty)
        .filter(|s| s.ident == "Vec")
        .and_then(generic_arg)
        .and_then(last_segment)
        .map(|s| s.ident == "u8")
        .unwrap_or(false)
}

fn classify_field(field: &syn::Field) -> syn::Result<FieldKind> {
    let (is_bytes, is_timestamp, is_oneof) = field_attrs(field)?;
    if is_oneof {
        return Ok(FieldKind::Oneof);
    }
    if is_timestamp {
        return Ok(FieldKind::Timestamp);
    }
    if is_bytes {
        return Ok(FieldKind::Bytes);
    }
    let segment = last_segment(&field.ty);
    let ident_name = segment.map(|s| s.ident.to_string()).unwrap_or_default();
    match ident_name.as_str() {
        "bool" | "i32" | "i64" | "u32" | "u64" | "f32" | "f64" | "String" => Ok(FieldKind::Scalar),
        "Vec" => {
            let inner = segment
                .and_then(generic_arg)
                .ok_or_else(|| syn::Error::new_spanned(&field.ty, "Vec<_> needs a concrete element type"))?;
            Ok(FieldKind::Repeated(Box::new(inner.clone())))
        }
        "BTreeMap" | "HashMap" => {
            let inner = segment
                .and_then(generic_arg)
                .ok_or_else(|| syn::Error::new_spanned(&field.ty, "map needs a value type"))?;
            Ok(FieldKind::Map(Box::new(inner.clone())))
        }
        _ => Ok(FieldKind::Message),
    }
}

fn value_variant_for_scalar(ty: &Type) -> Option<&'static str> {
    let name = last_segment(ty)?.ident.to_string();
    Some(match name.as_str() {
        "bool" => "Bool",
        "i32" => "Int32",
        "i64" => "Int64",
        "u32" => "Uint32",
        "u64" => "Uint64",
        "f32" => "Float",
        "f64" => "Double",
        "String" => "String",
        _ => return None,
    })
}

fn scalar_logical_type(ty: &Type) -> Option<TokenStream2> {
    let variant = value_variant_for_scalar(ty)?;
    let ident = format_ident!("{variant}");
    Some(quote! { ::conduit_core::LogicalType::#ident })
}

fn element_logical_type(ty: &Type) -> TokenStream2 {
    if is_vec_u8(ty) {
        return quote! { ::conduit_core::LogicalType::Bytes };
    }
    if let Some(lt) = scalar_logical_type(ty) {
        return lt;
    }
    quote! { ::conduit_core::LogicalType::Message(<#ty as ::conduit_core::Model>::schema().name.clone()) }
}

fn logical_type_tokens(kind: &FieldKind, ty: &Type) -> TokenStream2 {
    match kind {
        FieldKind::Scalar => scalar_logical_type(ty).expect("classified as scalar"),
        FieldKind::Bytes => quote! { ::conduit_core::LogicalType::Bytes },
        FieldKind::Timestamp => quote! { ::conduit_core::LogicalType::Timestamp },
        FieldKind::Oneof => quote! { ::conduit_core::LogicalType::Oneof(<#ty as ::conduit_core::ConduitOneof>::branches()) },
        FieldKind::Repeated(inner) => {
            let inner_ty = element_logical_type(inner);
            quote! { ::conduit_core::LogicalType::Repeated(Box::new(#inner_ty)) }
        }
        FieldKind::Map(inner) => {
            let inner_ty = element_logical_type(inner);
            quote! { ::conduit_core::LogicalType::Map(Box::new(#inner_ty)) }
        }
        FieldKind::Message => quote! { ::conduit_core::LogicalType::Message(<#ty as ::conduit_core::Model>::schema().name.clone()) },
    }
}

fn scalar_default_expr(ty: &Type) -> TokenStream2 {
    let name = last_segment(ty).map(|s| s.ident.to_string()).unwrap_or_default();
    match name.as_str() {
        "bool" => quote! { false },
        "i32" => quote! { 0i32 },
        "i64" => quote! { 0i64 },
        "u32" => quote! { 0u32 },
        "u64" => quote! { 0u64 },
        "f32" => quote! { 0.0f32 },
        "f64" => quote! { 0.0f64 },
        "String" => quote! { ::std::string::String::new() },
        _ => quote! { ::std::default::Default::default() },
    }
}

/// An expression of type `Result<#ty, RpcError>` consuming an owned `Value`
/// bound to `value_expr`. Used for repeated/map element conversion, where
/// (unlike a top-level field) a single bad element just fails the whole
/// field rather than being worth its own violation slot.
fn value_to_rust(value_expr: TokenStream2, ty: &Type, is_bytes: bool) -> TokenStream2 {
    if is_bytes {
        return quote! {
            match #value_expr {
                ::conduit_core::Value::Bytes(b) => Ok(b),
                _ => Err(::conduit_core::RpcError::invalid_field("<element>", "expected bytes")),
            }
        };
    }
    if let Some(variant) = value_variant_for_scalar(ty) {
        let variant_ident = format_ident!("{variant}");
        return quote! {
            match #value_expr {
                ::conduit_core::Value::#variant_ident(v) => Ok(v),
                _ => Err(::conduit_core::RpcError::invalid_field("<element>", "wrong type")),
            }
        };
    }
    quote! {
        match #value_expr {
            ::conduit_core::Value::Message(map) => <#ty as ::conduit_core::Model>::construct(map),
            _ => Err(::conduit_core::RpcError::invalid_field("<element>", "expected message")),
        }
    }
}

/// An expression of type `Value` from a reference-typed expression bound to
/// `value_expr` (an iterator item, always a reference).
fn value_from_rust(value_expr: TokenStream2, ty: &Type, is_bytes: bool) -> TokenStream2 {
    if is_bytes {
        return quote! { ::conduit_core::Value::Bytes(#value_expr.clone()) };
    }
    if let Some(variant) = value_variant_for_scalar(ty) {
        let variant_ident = format_ident!("{variant}");
        return quote! { ::conduit_core::Value::#variant_ident(#value_expr.clone()) };
    }
    quote! { ::conduit_core::Value::Message(::conduit_core::Model::project(#value_expr)) }
}

fn build_construct_stmt(field_ident: &syn::Ident, field_name: &str, kind: &FieldKind, ty: &Type) -> TokenStream2 {
    match kind {
        FieldKind::Scalar => {
            let variant = value_variant_for_scalar(ty).expect("classified as scalar");
            let variant_ident = format_ident!("{variant}");
            let default_expr = scalar_default_expr(ty);
            quote! {
                let #field_ident = match fields.remove(#field_name) {
                    Some(::conduit_core::Value::#variant_ident(v)) => v,
                    Some(_) => { __violations.push(#field_name, "wrong type"); #default_expr }
                    None => #default_expr,
                };
            }
        }
        FieldKind::Bytes => quote! {
            let #field_ident = match fields.remove(#field_name) {
                Some(::conduit_core::Value::Bytes(v)) => v,
                Some(_) => { __violations.push(#field_name, "expected bytes"); ::std::vec::Vec::new() }
                None => ::std::vec::Vec::new(),
            };
        },
        FieldKind::Timestamp => quote! {
            let #field_ident = match fields.remove(#field_name) {
                Some(::conduit_core::Value::Timestamp { seconds, nanos }) => ::conduit_core::Timestamp { seconds, nanos },
                Some(_) => { __violations.push(#field_name, "expected timestamp"); ::conduit_core::Timestamp::default() }
                None => ::conduit_core::Timestamp::default(),
            };
        },
        FieldKind::Oneof => quote! {
            let #field_ident = {
                let __ty = ::conduit_core::LogicalType::Oneof(<#ty as ::conduit_core::ConduitOneof>::branches());
                let __v = fields.remove(#field_name).unwrap_or_else(|| ::conduit_core::Value::default_for(&__ty));
                <#ty as ::conduit_core::ConduitOneof>::from_value(__v)?
            };
        },
        FieldKind::Message => quote! {
            let #field_ident = {
                let __map = match fields.remove(#field_name) {
                    Some(::conduit_core::Value::Message(map)) => map,
                    _ => ::std::collections::BTreeMap::new(),
                };
                <#ty as ::conduit_core::Model>::construct(__map)?
            };
        },
        FieldKind::Repeated(inner) => {
            let convert = value_to_rust(quote! { item }, inner, is_vec_u8(inner));
            quote! {
                let #field_ident = {
                    let __items = match fields.remove(#field_name) {
                        Some(::conduit_core::Value::Repeated(items)) => items,
                        _ => ::std::vec::Vec::new(),
                    };
                    let mut __out = ::std::vec::Vec::with_capacity(__items.len());
                    for item in __items {
                        __out.push((#convert)?);
                    }
                    __out
                };
            }
        }
        FieldKind::Map(inner) => {
            let convert = value_to_rust(quote! { v }, inner, is_vec_u8(inner));
            quote! {
                let #field_ident = {
                    let __entries = match fields.remove(#field_name) {
                        Some(::conduit_core::Value::Map(entries)) => entries,
                        _ => ::std::collections::BTreeMap::new(),
                    };
                    let mut __out = ::std::collections::BTreeMap::new();
                    for (k, v) in __entries {
                        __out.insert(k, (#convert)?);
                    }
                    __out
                };
            }
        }
    }
}

fn build_project_stmt(field_ident: &syn::Ident, field_name: &str, kind: &FieldKind, ty: &Type) -> TokenStream2 {
    match kind {
        FieldKind::Scalar => {
            let variant = value_variant_for_scalar(ty).expect("classified as scalar");
            let variant_ident = format_ident!("{variant}");
            quote! { __out.insert(#field_name.to_string(), ::conduit_core::Value::#variant_ident(self.#field_ident.clone())); }
        }
        FieldKind::Bytes => {
            quote! { __out.insert(#field_name.to_string(), ::conduit_core::Value::Bytes(self.#field_ident.clone())); }
        }
        FieldKind::Timestamp => quote! {
            __out.insert(
                #field_name.to_string(),
                ::conduit_core::Value::Timestamp { seconds: self.#field_ident.seconds, nanos: self.#field_ident.nanos },
            );
        },
        FieldKind::Oneof => quote! {
            __out.insert(#field_name.to_string(), self.#field_ident.into_value());
        },
        FieldKind::Message => quote! {
            __out.insert(
                #field_name.to_string(),
                ::conduit_core::Value::Message(::conduit_core::Model::project(&self.#field_ident)),
            );
        },
        FieldKind::Repeated(inner) => {
            let to_value = value_from_rust(quote! { item }, inner, is_vec_u8(inner));
            quote! {
                __out.insert(
                    #field_name.to_string(),
                    ::conduit_core::Value::Repeated(self.#field_ident.iter().map(|item| #to_value).collect()),
                );
            }
        }
        FieldKind::Map(inner) => {
            let to_value = value_from_rust(quote! { v }, inner, is_vec_u8(inner));
            quote! {
                __out.insert(
                    #field_name.to_string(),
                    ::conduit_core::Value::Map(self.#field_ident.iter().map(|(k, v)| (k.clone(), #to_value)).collect()),
                );
            }
        }
    }
}

fn expand_model(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_attrs = parse_struct_attrs(&input)?;
    let ident = input.ident.clone();
    let fields = match input.data {
        Data::Struct(s) => match s.fields {
            Fields::Named(named) => named.named,
            _ => return Err(syn::Error::new_spanned(ident, "#[derive(Model)] requires named fields")),
        },
        _ => return Err(syn::Error::new_spanned(ident, "#[derive(Model)] only supports structs")),
    };

    let mut field_schema_tokens = Vec::new();
    let mut construct_stmts = Vec::new();
    let mut project_stmts = Vec::new();
    let mut field_idents = Vec::new();

    for field in &fields {
        let field_ident = field.ident.clone().expect("named field");
        let field_name = field_ident.to_string();
        let kind = classify_field(field)?;
        let ty = &field.ty;
        let logical_ty = logical_type_tokens(&kind, ty);

        field_schema_tokens.push(quote! {
            ::conduit_core::FieldSchema { name: #field_name.to_string(), ty: #logical_ty }
        });
        construct_stmts.push(build_construct_stmt(&field_ident, &field_name, &kind, ty));
        project_stmts.push(build_project_stmt(&field_ident, &field_name, &kind, ty));
        field_idents.push(field_ident);
    }

    let schema_path = &struct_attrs.path;
    let camel_case = struct_attrs.camel_case;

    Ok(quote! {
        impl ::conduit_core::Model for #ident {
            fn schema() -> ::conduit_core::Schema {
                ::conduit_core::Schema::new(#schema_path, vec![#(#field_schema_tokens),*])
                    .with_camel_case(#camel_case)
            }

            fn construct(
                mut fields: ::std::collections::BTreeMap<::std::string::String, ::conduit_core::Value>,
            ) -> ::std::result::Result<Self, ::conduit_core::RpcError> {
                let mut __violations = ::conduit_core::ViolationSet::new();
                #(#construct_stmts)*
                __violations.into_result()?;
                Ok(#ident { #(#field_idents),* })
            }

            fn project(&self) -> ::std::collections::BTreeMap<::std::string::String, ::conduit_core::Value> {
                let mut __out = ::std::collections::BTreeMap::new();
                #(#project_stmts)*
                __out
            }
        }
    })
}

// ---------------------------------------------------------------------
// #[derive(ConduitOneof)]
// ---------------------------------------------------------------------

/// Implements `conduit_core::ConduitOneof` for an enum whose variants each
/// hold exactly one field -- the Rust-side counterpart of a schema `oneof`
/// (§3, §4.3 rule 5). Recognized attributes, on each variant:
///
/// - `#[conduit(name = "branch_name")]` -- the wire branch name; defaults to
///   the variant name converted to snake_case.
/// - `#[conduit(default)]` -- marks the branch selected when decoding an
///   empty frame, using the branch type's own zero value.
/// - `#[conduit(default = <literal>)]` -- same, but with an explicit
///   non-zero default (needed for e.g. a `oneof` whose default boolean
///   branch is `true`, per S3).
#[proc_macro_derive(ConduitOneof, attributes(conduit))]
pub fn derive_conduit_oneof(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_conduit_oneof(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn pascal_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.char_indices() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

struct VariantAttrs {
    name: Option<String>,
    is_default: bool,
    default_value: Option<Lit>,
}

fn parse_variant_attrs(variant: &syn::Variant) -> syn::Result<VariantAttrs> {
    let mut out = VariantAttrs {
        name: None,
        is_default: false,
        default_value: None,
    };
    for attr in &variant.attrs {
        if !attr.path().is_ident("conduit") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let lit: Lit = meta.value()?.parse()?;
                if let Lit::Str(s) = lit {
                    out.name = Some(s.value());
                    Ok(())
                } else {
                    Err(meta.error("expected a string literal"))
                }
            } else if meta.path.is_ident("default") {
                out.is_default = true;
                if meta.input.peek(syn::Token![=]) {
                    out.default_value = Some(meta.value()?.parse()?);
                }
                Ok(())
            } else {
                Err(meta.error("unrecognized conduit variant attribute"))
            }
        })?;
    }
    Ok(out)
}

fn literal_to_value(lit: &Lit, ty: &Type) -> syn::Result<TokenStream2> {
    let variant = value_variant_for_scalar(ty)
        .ok_or_else(|| syn::Error::new_spanned(ty, "explicit default literals are only supported for scalar branches"))?;
    let variant_ident = format_ident!("{variant}");
    if variant == "String" {
        Ok(quote! { ::conduit_core::Value::String(#lit.to_string()) })
    } else {
        Ok(quote! { ::conduit_core::Value::#variant_ident(#lit) })
    }
}

fn expand_conduit_oneof(input: DeriveInput) -> syn::Result<TokenStream2> {
    let ident = input.ident.clone();
    let data = match input.data {
        Data::Enum(e) => e,
        _ => return Err(syn::Error::new_spanned(ident, "#[derive(ConduitOneof)] only supports enums")),
    };

    let mut branch_tokens = Vec::new();
    let mut into_value_arms = Vec::new();
    let mut from_value_arms = Vec::new();

    for variant in &data.variants {
        let variant_ident = &variant.ident;
        let field = match &variant.fields {
            Fields::Unnamed(f) if f.unnamed.len() == 1 => &f.unnamed[0],
            _ => {
                return Err(syn::Error::new_spanned(
                    variant,
                    "#[derive(ConduitOneof)] requires each variant to hold exactly one field, e.g. Bool(bool)",
                ))
            }
        };
        let ty = &field.ty;
        let attrs = parse_variant_attrs(variant)?;
        let branch_name = attrs.name.unwrap_or_else(|| pascal_to_snake(&variant_ident.to_string()));
        let logical_ty = if let Some(lt) = scalar_logical_type(ty) {
            lt
        } else {
            quote! { ::conduit_core::LogicalType::Message(<#ty as ::conduit_core::Model>::schema().name.clone()) }
        };

        let default_call = if attrs.is_default {
            match &attrs.default_value {
                Some(lit) => {
                    let value_expr = literal_to_value(lit, ty)?;
                    quote! { .default_branch(Some(#value_expr)) }
                }
                None => quote! { .default_branch(None) },
            }
        } else {
            quote! {}
        };

        branch_tokens.push(quote! {
            ::conduit_core::OneofBranch::new(#branch_name, #logical_ty) #default_call
        });

        into_value_arms.push(if value_variant_for_scalar(ty).is_some() {
            let variant_wrap = format_ident!("{}", value_variant_for_scalar(ty).unwrap());
            quote! { #ident::#variant_ident(v) => ::conduit_core::Value::#variant_wrap(v.clone()) }
        } else {
            quote! { #ident::#variant_ident(v) => ::conduit_core::Value::Message(::conduit_core::Model::project(v)) }
        });

        from_value_arms.push(if let Some(scalar_variant) = value_variant_for_scalar(ty) {
            let variant_wrap = format_ident!("{scalar_variant}");
            quote! {
                #branch_name => match *inner {
                    ::conduit_core::Value::#variant_wrap(v) => Ok(#ident::#variant_ident(v)),
                    _ => Err(::conduit_core::RpcError::invalid_field("<oneof>", "wrong type for branch")),
                }
            }
        } else {
            quote! {
                #branch_name => match *inner {
                    ::conduit_core::Value::Message(map) => {
                        Ok(#ident::#variant_ident(<#ty as ::conduit_core::Model>::construct(map)?))
                    }
                    _ => Err(::conduit_core::RpcError::invalid_field("<oneof>", "expected message for branch")),
                }
            }
        });
    }

    Ok(quote! {
        impl ::conduit_core::ConduitOneof for #ident {
            fn branches() -> ::std::vec::Vec<::conduit_core::OneofBranch> {
                vec![#(#branch_tokens),*]
            }

            fn into_value(&self) -> ::conduit_core::Value {
                match self {
                    #(#into_value_arms),*
                }
            }

            fn from_value(value: ::conduit_core::Value) -> ::std::result::Result<Self, ::conduit_core::RpcError> {
                match value {
                    ::conduit_core::Value::Oneof(name, inner) => match name.as_str() {
                        #(#from_value_arms,)*
                        _ => Err(::conduit_core::RpcError::invalid_field("<oneof>", "unknown branch")),
                    },
                    _ => Err(::conduit_core::RpcError::invalid_field("<oneof>", "expected a oneof value")),
                }
            }
        }
    })
}

// ---------------------------------------------------------------------
// #[conduit::endpoint]
// ---------------------------------------------------------------------

/// Sugar over `Endpoint::new(...)` (§4.4, Design Note): wraps an `async fn`
/// taking a `Model` request and a `DependencyScope` into a function
/// returning a fully-built `conduit_core::Endpoint`, ready to pass to a
/// router's `register`. The explicit `Endpoint::new` form this expands to
/// stays available for handlers this macro's conventions don't fit.
///
/// ```ignore
/// #[conduit::endpoint(path = "/greeter.Greeter/SayHello", cardinality = "unary_unary")]
/// async fn say_hello(req: HelloRequest, deps: DependencyScope) -> Result<HelloReply, RpcError> {
///     Ok(HelloReply { message: format!("Hello, {}!", req.name) })
/// }
/// ```
///
/// Supports `cardinality = "unary_unary"` and `cardinality = "unary_stream"`
/// (whose fn must return `Result<BoxStream<'static, Result<ReplyTy, RpcError>>, RpcError>`
/// and needs `futures_util::StreamExt` in scope for the `.map()` conversion
/// below to resolve). `stream_unary`/`stream_stream` endpoints take a
/// request stream the generic request-conversion step here doesn't cover;
/// register those with `Endpoint::new` directly.
#[proc_macro_attribute]
pub fn endpoint(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as EndpointArgs);
    let func = parse_macro_input!(item as ItemFn);
    match expand_endpoint(args, func.clone()) {
        Ok(tokens) => {
            let mut out = quote! { #func };
            out.extend(tokens);
            out.into()
        }
        Err(err) => err.to_compile_error().into(),
    }
}

struct EndpointArgs {
    path: String,
    cardinality: String,
}

impl Parse for EndpointArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut path = None;
        let mut cardinality = "unary_unary".to_string();
        let metas = Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)?;
        for meta in metas {
            let value = match &meta.value {
                Expr::Lit(ExprLit { lit: Lit::Str(s), .. }) => s.value(),
                _ => return Err(syn::Error::new_spanned(&meta.value, "expected a string literal")),
            };
            if meta.path.is_ident("path") {
                path = Some(value);
            } else if meta.path.is_ident("cardinality") {
                cardinality = value;
            } else {
                return Err(syn::Error::new_spanned(&meta.path, "unrecognized endpoint attribute"));
            }
        }
        let path = path.ok_or_else(|| syn::Error::new(proc_macro2::Span::call_site(), "#[conduit::endpoint] requires path = \"...\""))?;
        Ok(EndpointArgs { path, cardinality })
    }
}

fn result_ok_type(ty: &Type) -> Option<&Type> {
    last_segment(ty).filter(|s| s.ident == "Result").and_then(generic_arg)
}

fn expand_endpoint(args: EndpointArgs, func: ItemFn) -> syn::Result<TokenStream2> {
    let fn_name = &func.sig.ident;
    let endpoint_fn_name = format_ident!("{}_endpoint", fn_name);

    let mut inputs = func.sig.inputs.iter();
    let req_arg = inputs
        .next()
        .ok_or_else(|| syn::Error::new_spanned(&func.sig, "endpoint handler needs a request parameter"))?;
    let req_ty = match req_arg {
        FnArg::Typed(pat_ty) => &*pat_ty.ty,
        FnArg::Receiver(_) => {
            return Err(syn::Error::new_spanned(req_arg, "endpoint handler cannot take self"))
        }
    };
    let return_ty = match &func.sig.output {
        ReturnType::Type(_, ty) => &**ty,
        ReturnType::Default => {
            return Err(syn::Error::new_spanned(&func.sig, "endpoint handler must return a Result"))
        }
    };
    let ok_ty = result_ok_type(return_ty)
        .ok_or_else(|| syn::Error::new_spanned(return_ty, "endpoint handler must return Result<_, RpcError>"))?;

    let cardinality_ident = match args.cardinality.as_str() {
        "unary_unary" => format_ident!("UnaryUnary"),
        "unary_stream" => format_ident!("UnaryStream"),
        other => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("unsupported endpoint cardinality \"{other}\" -- use Endpoint::new directly for stream_unary/stream_stream"),
            ))
        }
    };

    let path = &args.path;

    let (reply_ty, call_and_wrap) = if args.cardinality == "unary_stream" {
        let stream_item = last_segment(ok_ty)
            .filter(|s| s.ident == "BoxStream")
            .and_then(generic_arg)
            .ok_or_else(|| syn::Error::new_spanned(ok_ty, "unary_stream handler must return BoxStream<'static, Result<ReplyTy, RpcError>>"))?;
        let reply_ty = result_ok_type(stream_item)
            .ok_or_else(|| syn::Error::new_spanned(stream_item, "unary_stream handler's BoxStream must carry Result<ReplyTy, RpcError> items"))?;
        let wrap = quote! {
            let __stream = #fn_name(__req, args.deps).await?;
            let __mapped = ::futures_util::StreamExt::map(__stream, |item| {
                item.map(|v| ::conduit_core::Value::Message(::conduit_core::Model::project(&v)))
            });
            Ok(::conduit_core::ReplyOutput::Stream(Box::pin(__mapped)))
        };
        (reply_ty.clone(), wrap)
    } else {
        let wrap = quote! {
            let __reply = #fn_name(__req, args.deps).await?;
            Ok(::conduit_core::ReplyOutput::Unary(::conduit_core::Value::Message(::conduit_core::Model::project(&__reply))))
        };
        (ok_ty.clone(), wrap)
    };

    Ok(quote! {
        pub fn #endpoint_fn_name() -> ::conduit_core::Endpoint {
            let __handler = move |args: ::conduit_core::HandlerArgs| -> ::conduit_core::BoxFuture<'static, ::std::result::Result<::conduit_core::ReplyOutput, ::conduit_core::RpcError>> {
                Box::pin(async move {
                    let __value = match args.request {
                        ::conduit_core::RequestInput::Unary(v) => v,
                        ::conduit_core::RequestInput::Stream(_) => return Err(::conduit_core::RpcError::Internal),
                    };
                    let __fields = match __value {
                        ::conduit_core::Value::Message(m) => m,
                        _ => ::std::collections::BTreeMap::new(),
                    };
                    let __req = <#req_ty as ::conduit_core::Model>::construct(__fields)?;
                    #call_and_wrap
                })
            };
            ::conduit_core::Endpoint::new(
                ::conduit_core::Path::from_raw(#path),
                ::conduit_core::Cardinality::#cardinality_ident,
                <#req_ty as ::conduit_core::Model>::schema(),
                <#reply_ty as ::conduit_core::Model>::schema(),
                ::std::sync::Arc::new(__handler),
            )
        }
    })
}
