extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DataEnum, DataStruct, DeriveInput, Expr, Fields};

#[proc_macro_derive(Fault, attributes(fault))]
pub fn derive_fault(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;
    match input.data {
        Data::Struct(DataStruct { .. }) => {
            let kind: Option<&Attribute> =
                input.attrs.iter().find(|attr| attr.path.is_ident("fault"));
            match kind {
                Some(attribute) => {
                    let tt: Expr = attribute.parse_args().unwrap();
                    quote!(
                        impl Fault for #name {
                            fn fault(&self) -> fault::FaultKind {
                                #tt
                            }
                        }
                    )
                    .into()
                }
                None => panic!("struct must have a #[fault(<KIND>)] attribute"),
            }
        }
        Data::Enum(DataEnum { variants, .. }) => {
            let q = variants.iter().map(|variant| {
                let v = &variant.ident;
                let kind: Option<&Attribute> = variant
                    .attrs
                    .iter()
                    .find(|attr| attr.path.is_ident("fault"));
                if kind.is_none() {
                    panic!("variant {} is missing its #[fault(<KIND>)] attribute", v);
                }
                let kind: Expr = kind.unwrap().parse_args().unwrap();
                match variant.fields {
                    Fields::Unnamed(_) => quote! {
                        #name::#v(..) => { #kind }
                    },
                    Fields::Named(_) => quote! {
                        #name::#v{ .. } => { #kind }
                    },
                    Fields::Unit => quote! {
                        #name::#v => { #kind }
                    },
                }
            });
            quote!(
                impl Fault for #name {
                    fn fault(&self) -> fault::FaultKind {
                        match self {
                            #(#q),*
                        }
                    }
                }
            )
            .into()
        }
        Data::Union(..) => panic!("unions cannot carry a fault kind"),
    }
}
