// =============================================================================
// Binance adapter — MarketSource implementation over public market data
// =============================================================================

pub mod market_source;

pub use market_source::BinanceMarketSource;
