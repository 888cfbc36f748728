use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Fields, LitStr, Path, spanned::Spanned};

pub fn derive_operands(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`Operands` can only be derived for structs")
                .to_compile_error();
        }
    };

    // only named fields carry a meaningful operand name
    let fields_named = match fields {
        Fields::Named(fields_named) => fields_named,
        _ => {
            return syn::Error::new(
                fields.span(),
                "`Operands` can only be derived for structs with named fields",
            )
            .to_compile_error();
        }
    };

    // collect fields with #[operand] attribute, keeping declaration order
    let marked_fields: Vec<_> = fields_named
        .named
        .iter()
        .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("operand")))
        .filter_map(|f| f.ident.clone())
        .collect();

    if marked_fields.is_empty() {
        return syn::Error::new(
            fields_named.span(),
            "no field marked with #[operand] attribute",
        )
        .to_compile_error();
    }

    let names: Vec<_> = marked_fields
        .iter()
        .map(|ident| LitStr::new(&ident.to_string(), ident.span()))
        .collect();

    let name = input.ident;

    // parse operands attributes
    let mut crate_name = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("operands") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported is `crate`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    // determine the base path for trait implementation
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom::memory),
        None => quote!(::weft::loom::memory),
    };

    // handle struct generics
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    quote! {
        impl #impl_generics #base_path::Operands for #name #ty_generics #where_clause {
            fn operands(&self) -> ::std::vec::Vec<&#base_path::MemoryDesc> {
                let mut operands = ::std::vec::Vec::new();
                #(#base_path::IntoOperands::collect_operands(&self.#marked_fields, &mut operands);)*
                operands
            }

            fn operand_names(&self) -> ::std::vec::Vec<&'static str> {
                let mut names = ::std::vec::Vec::new();
                #(#base_path::IntoOperands::collect_names(&self.#marked_fields, #names, &mut names);)*
                names
            }
        }
    }
}
