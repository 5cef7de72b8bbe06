// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`conntrack::ddi::stat::StatProvider`] implementation
/// given a struct of named fields of type
/// [`conntrack::ddi::stat::StatU64`].
///
/// ```Rust
/// #[derive(StatProvider)]
/// struct TableStats {
///     insert: StatU64,
///     delete: StatU64,
/// }
/// ```
///
/// This macro generates a plain-old-data snapshot type alongside the
/// provider implementation.
///
/// ```Rust
/// #[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
/// pub struct TableStatsSnap {
///     pub insert: u64,
///     pub delete: u64,
/// }
///
/// impl StatProvider for TableStats {
///     const NUM_FIELDS: u32 = 2;
///     type Snap = TableStatsSnap;
///
///     fn new() -> Self { ... }
///     fn snapshot(&self) -> TableStatsSnap { ... }
///     fn reset(&self) { ... }
/// }
///
/// impl AddAssign for TableStatsSnap { ... }
/// ```
///
/// The `AddAssign` impl lets per-CPU snapshots be folded into a
/// total.
#[proc_macro_derive(StatProvider)]
pub fn derive_stat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            syn::Fields::Unnamed(_) => {
                return error(
                    &ident,
                    "A StatProvider cannot have unnamed fields",
                );
            }

            syn::Fields::Unit => {
                return error(
                    &ident,
                    "A unit struct cannot be a StatProvider",
                );
            }
        },

        _ => return error(&ident, "Only a struct may be a StatProvider"),
    };

    let num_fields = fields.len() as u32;
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output: proc_macro2::TokenStream = quote! {
        #[derive(
            Clone,
            Copy,
            Debug,
            Default,
            Eq,
            PartialEq,
            ::serde::Deserialize,
            ::serde::Serialize,
        )]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl #ident_snap {
            /// The counter names, in declaration order.
            pub const NAMES: &'static [&'static str] = &[
                #( stringify!(#fields_ident), )*
            ];

            /// The counter values, in the same order as `NAMES`.
            pub fn values(&self) -> ::std::vec::Vec<u64> {
                ::std::vec![ #( self.#fields_ident, )* ]
            }
        }

        impl ::core::ops::AddAssign for #ident_snap {
            fn add_assign(&mut self, other: Self) {
                #( self.#fields_ident += other.#fields_ident; )*
            }
        }

        impl ::conntrack::ddi::stat::StatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn new() -> Self {
                use ::conntrack::ddi::stat::StatU64;

                Self {
                    #( #fields_ident: StatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }

            fn reset(&self) {
                #( self.#fields_ident.set(0); )*
            }
        }
    };

    output.into()
}

fn error(ident: &Ident, msg: &str) -> TokenStream {
    syn::Error::new(ident.span(), msg).to_compile_error().into()
}
