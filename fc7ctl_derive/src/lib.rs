use proc_macro::TokenStream;
use quote::quote;
use syn::{parse, parse_macro_input, DeriveInput};

#[proc_macro_derive(BusWord)]
/// Derived on a 4-byte packed_struct to shim in the register word conversions
pub fn derive_bus_word(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let word_name = input.ident;
    let generated = quote! {
        impl BusWord for #word_name {
            fn to_word(&self) -> u32 {
                u32::from_be_bytes(self.pack().expect("Packing failed, this shouldn't happen"))
            }

            fn from_word(word: u32) -> TransportResult<Self> {
                Ok(Self::unpack(&word.to_be_bytes())?)
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Tags a phase tuner payload with the command type nibble it is sent under
pub fn command_type(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr = match parse::<syn::Lit>(attr).expect("Error parsing attribute") {
        syn::Lit::Int(v) => v,
        _ => panic!("The command type must be a literal integer (hopefully a u8)"),
    };
    let num = attr;
    let item = parse_macro_input!(item as DeriveInput);
    let ident = item.clone().ident;

    let generated = quote! {
        impl TunerCommand for #ident {
            const COMMAND_TYPE: u8 = #num as u8;
        }
        #item
    };
    TokenStream::from(generated)
}
