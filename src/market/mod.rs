pub mod provider;
pub mod source;

pub use provider::MarketDataProvider;
pub use source::{Bar, MarketDataSource, StockBasic, StubMarketDataSource};
