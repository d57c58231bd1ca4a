pub mod forecast;
pub mod parameters;
pub mod reconcile;

pub(crate) fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}
