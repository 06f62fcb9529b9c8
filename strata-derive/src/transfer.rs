use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Index};

pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
	let DeriveInput {
		ident,
		generics,
		data,
		..
	} = syn::parse(tokens).unwrap();

	let data = match data {
		Data::Struct(data) => data,
		Data::Enum(_) => panic!("Enums are not supported"),
		Data::Union(_) => panic!("Unions are not supported"),
	};

	let transfers: Vec<TokenStream> = match &data.fields {
		Fields::Named(fields) => fields
			.named
			.iter()
			.map(|field| {
				let ident = &field.ident;
				quote!(::strata::archive::Transfer::transfer(&mut self.#ident, archive)?;)
			})
			.collect(),
		Fields::Unnamed(fields) => fields
			.unnamed
			.iter()
			.enumerate()
			.map(|(i, _)| {
				let index = Index::from(i);
				quote!(::strata::archive::Transfer::transfer(&mut self.#index, archive)?;)
			})
			.collect(),
		Fields::Unit => Vec::new(),
	};

	let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

	quote! {
		impl #impl_generics ::strata::archive::Transfer for #ident #ty_generics #where_clause {
			fn transfer(
				&mut self,
				archive: &mut dyn ::strata::archive::Archive,
			) -> ::strata::errors::Result<()> {
				#(#transfers)*
				Ok(())
			}
		}
	}
}
