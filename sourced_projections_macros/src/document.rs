use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, Ident, LitStr};

/// Options collected from `#[document(...)]` on the struct.
#[derive(Default)]
struct DocumentArgs {
    collection: Option<String>,
    reset: Option<Ident>,
}

pub fn derive_document(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let args = match extract_args(&input) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let collection = args
        .collection
        .unwrap_or_else(|| format!("{}s", to_snake_case(&name.to_string())));

    let reset = args.reset.map(|method| {
        quote! {
            fn reset(self) -> Self {
                Self::#method(self)
            }
        }
    });

    let expanded = quote! {
        impl #impl_generics sourced_projections::Document for #name #ty_generics #where_clause {
            const COLLECTION: &'static str = #collection;

            #reset
        }
    };

    TokenStream::from(expanded)
}

fn extract_args(input: &DeriveInput) -> syn::Result<DocumentArgs> {
    let mut args = DocumentArgs::default();

    for attr in &input.attrs {
        if !attr.path().is_ident("document") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                let value: LitStr = meta.value()?.parse()?;
                args.collection = Some(value.value());
                Ok(())
            } else if meta.path.is_ident("reset") {
                let value: Ident = meta.value()?.parse()?;
                args.reset = Some(value);
                Ok(())
            } else {
                Err(meta.error("expected `collection = \"...\"` or `reset = method`"))
            }
        })?;
    }

    Ok(args)
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(ch.to_lowercase());
        } else {
            result.push(ch);
        }
    }
    result
}
