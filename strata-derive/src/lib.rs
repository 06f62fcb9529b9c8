mod transfer;

use proc_macro::TokenStream;

#[proc_macro_derive(Transfer)]
pub fn derive_transfer(input: TokenStream) -> TokenStream {
	transfer::derive(input).into()
}
