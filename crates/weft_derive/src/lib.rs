use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod operands;

/// Derives `Operands` for a primitive descriptor.
///
/// Fields marked with `#[operand]` become the primitive's buffer operands,
/// in declaration order. That order is the dependency order recorded by the emitter.
#[proc_macro_derive(Operands, attributes(operand, operands))]
pub fn derive_operands(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = operands::derive_operands(input);
    expanded.into()
}
