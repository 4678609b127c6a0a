// Instrument classification and pip conversion
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const METALS: &[&str] = &["XAU", "XAG", "XPT", "XPD"];
const CRYPTO: &[&str] = &[
    "BTC", "ETH", "SOL", "XRP", "LTC", "ADA", "DOGE", "BNB", "DOT", "LINK",
];
const INDICES: &[&str] = &[
    "US30", "US500", "SPX500", "NAS100", "US100", "GER40", "DE40", "UK100", "JP225", "FRA40",
    "AUS200", "HK50", "EU50", "STOXX50",
];
const BONDS: &[&str] = &["BUND", "BOBL", "SCHATZ", "UST", "TNOTE", "GILT", "OAT", "BTP"];
const FUND_SUFFIXES: &[&str] = &[".ETF", "_ETF", ".FUND"];
const CURRENCIES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "NZD", "CAD", "SEK", "NOK", "DKK", "SGD", "HKD",
    "MXN", "ZAR", "TRY", "PLN", "CNH",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AssetClass {
    Forex,
    Metal,
    Index,
    Crypto,
    Bond,
    Equity,
    Fund,
}

impl AssetClass {
    /// Classify a broker symbol by name
    pub fn classify(symbol: &str) -> Self {
        let upper = symbol.to_uppercase();

        if FUND_SUFFIXES.iter().any(|s| upper.ends_with(s)) {
            return AssetClass::Fund;
        }
        if METALS.iter().any(|m| upper.starts_with(m)) {
            return AssetClass::Metal;
        }
        if CRYPTO.iter().any(|c| upper.starts_with(c)) {
            return AssetClass::Crypto;
        }
        if INDICES.iter().any(|i| upper.starts_with(i)) {
            return AssetClass::Index;
        }
        if BONDS.iter().any(|b| upper.starts_with(b)) {
            return AssetClass::Bond;
        }
        if is_currency_pair(&upper) {
            return AssetClass::Forex;
        }

        AssetClass::Equity
    }
}

fn is_currency_pair(upper: &str) -> bool {
    currency_legs(upper).is_some()
}

/// Base and quote currency of a currency pair symbol
fn currency_legs(symbol: &str) -> Option<(String, String)> {
    let core: String = symbol
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if core.len() != 6 {
        return None;
    }
    let (base, quote) = core.split_at(3);
    (CURRENCIES.contains(&base) && CURRENCIES.contains(&quote))
        .then(|| (base.to_string(), quote.to_string()))
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Static trading properties of one instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentContext {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub point_size: f64,
    pub pip_size: f64,
    pub contract_size: f64,
    pub min_volume: f64,
    pub max_volume: f64,
    pub volume_step: f64,
    /// Broker-reported price of one unit of quote currency in account
    /// currency; derived from the pair when absent
    #[serde(default)]
    pub quote_to_account: Option<f64>,
}

impl InstrumentContext {
    /// Build a context from the asset class conventions of `symbol`
    pub fn for_symbol(symbol: &str) -> Self {
        let asset_class = AssetClass::classify(symbol);
        let upper = symbol.to_uppercase();

        let (pip_size, point_size, contract_size, min_volume, max_volume, volume_step) =
            match asset_class {
                AssetClass::Forex if upper.contains("JPY") => {
                    (0.01, 0.001, 100_000.0, 0.01, 100.0, 0.01)
                }
                AssetClass::Forex => (0.0001, 0.00001, 100_000.0, 0.01, 100.0, 0.01),
                AssetClass::Metal if upper.starts_with("XAU") => {
                    (0.1, 0.01, 100.0, 0.01, 50.0, 0.01)
                }
                AssetClass::Metal => (0.01, 0.001, 5_000.0, 0.01, 50.0, 0.01),
                AssetClass::Index => (1.0, 0.1, 1.0, 0.1, 500.0, 0.1),
                AssetClass::Crypto => (1.0, 0.01, 1.0, 0.01, 10.0, 0.01),
                AssetClass::Bond => (0.01, 0.001, 1_000.0, 0.1, 100.0, 0.1),
                AssetClass::Equity => (0.01, 0.01, 1.0, 1.0, 10_000.0, 1.0),
                AssetClass::Fund => (0.01, 0.01, 1.0, 1.0, 10_000.0, 1.0),
            };

        Self {
            symbol: symbol.to_string(),
            asset_class,
            point_size,
            pip_size,
            contract_size,
            min_volume,
            max_volume,
            volume_step,
            quote_to_account: None,
        }
    }

    /// Everything wrong with these properties, empty when usable
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("pip_size", self.pip_size),
            ("point_size", self.point_size),
            ("contract_size", self.contract_size),
            ("volume_step", self.volume_step),
        ] {
            if !positive(value) {
                problems.push(format!("{}: {} must be positive, got {}", self.symbol, name, value));
            }
        }
        if !positive(self.min_volume) || !self.max_volume.is_finite() || self.min_volume > self.max_volume {
            problems.push(format!(
                "{}: volume limits [{}, {}] must satisfy 0 < min <= max",
                self.symbol, self.min_volume, self.max_volume
            ));
        }
        if let Some(rate) = self.quote_to_account {
            if !positive(rate) {
                problems.push(format!("{}: quote_to_account must be positive, got {}", self.symbol, rate));
            }
        }
        problems
    }

    pub fn validate(&self) -> Result<(), String> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Convert a raw price delta to pips
    pub fn to_pips(&self, price_delta: f64) -> f64 {
        price_delta / self.pip_size
    }

    /// Convert a pip distance back to a price delta
    pub fn to_price(&self, pips: f64) -> f64 {
        pips * self.pip_size
    }

    /// Value of one unit of quote currency in `account_currency` at `price`
    ///
    /// `None` for a cross whose quote currency is not the account currency
    /// and no broker rate was supplied.
    pub fn quote_to_account_rate(&self, price: f64, account_currency: &str) -> Option<f64> {
        if let Some(rate) = self.quote_to_account {
            return Some(rate);
        }
        match currency_legs(&self.symbol) {
            Some((_, quote)) if quote.eq_ignore_ascii_case(account_currency) => Some(1.0),
            Some((base, _)) if base.eq_ignore_ascii_case(account_currency) => {
                positive(price).then(|| 1.0 / price)
            }
            Some(_) => None,
            // Metals, indices and the rest are quoted in account currency
            None => Some(1.0),
        }
    }

    /// Value of a one-pip move for one lot, in quote currency
    pub fn pip_value_in_quote(&self) -> f64 {
        self.pip_size * self.contract_size
    }

    /// Value of a one-pip move for one lot, in account currency
    pub fn pip_value_per_lot(&self, price: f64, account_currency: &str) -> Option<f64> {
        self.quote_to_account_rate(price, account_currency)
            .map(|rate| self.pip_value_in_quote() * rate)
    }
}

/// Broker-reported values that override the class conventions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstrumentOverride {
    pub point_size: Option<f64>,
    pub pip_size: Option<f64>,
    pub contract_size: Option<f64>,
    pub min_volume: Option<f64>,
    pub max_volume: Option<f64>,
    pub volume_step: Option<f64>,
    pub quote_to_account: Option<f64>,
}

impl InstrumentOverride {
    /// Class conventions of `symbol` with these overrides applied
    pub fn resolve(&self, symbol: &str) -> InstrumentContext {
        let mut ctx = InstrumentContext::for_symbol(symbol);
        self.apply(&mut ctx);
        ctx
    }

    fn apply(&self, ctx: &mut InstrumentContext) {
        if let Some(v) = self.point_size {
            ctx.point_size = v;
        }
        if let Some(v) = self.pip_size {
            ctx.pip_size = v;
        }
        if let Some(v) = self.contract_size {
            ctx.contract_size = v;
        }
        if let Some(v) = self.min_volume {
            ctx.min_volume = v;
        }
        if let Some(v) = self.max_volume {
            ctx.max_volume = v;
        }
        if let Some(v) = self.volume_step {
            ctx.volume_step = v;
        }
        if let Some(v) = self.quote_to_account {
            ctx.quote_to_account = Some(v);
        }
    }
}

/// Cache of instrument contexts, keyed by uppercase symbol
///
/// A context is created on first observation of a symbol and only changes
/// through [`PipValueResolver::refresh`].
#[derive(Debug, Default)]
pub struct PipValueResolver {
    cache: HashMap<String, InstrumentContext>,
    overrides: HashMap<String, InstrumentOverride>,
}

impl PipValueResolver {
    pub fn new(overrides: HashMap<String, InstrumentOverride>) -> Self {
        Self {
            cache: HashMap::new(),
            overrides: overrides
                .into_iter()
                .map(|(symbol, ov)| (symbol.to_uppercase(), ov))
                .collect(),
        }
    }

    /// Get the context for `symbol`, creating it on first observation
    pub fn context(&mut self, symbol: &str) -> &InstrumentContext {
        let symbol = symbol.to_uppercase();
        let overrides = &self.overrides;
        self.cache.entry(symbol.clone()).or_insert_with(|| {
            let ctx = match overrides.get(&symbol) {
                Some(ov) => ov.resolve(&symbol),
                None => InstrumentContext::for_symbol(&symbol),
            };
            tracing::debug!(
                symbol = %symbol,
                asset_class = ?ctx.asset_class,
                pip_size = ctx.pip_size,
                "Registered instrument"
            );
            ctx
        })
    }

    /// Replace the cached context after a broker-reported change
    pub fn refresh(&mut self, mut ctx: InstrumentContext) -> &InstrumentContext {
        ctx.symbol = ctx.symbol.to_uppercase();
        tracing::info!(symbol = %ctx.symbol, "Refreshed instrument context");
        let symbol = ctx.symbol.clone();
        self.cache.insert(symbol.clone(), ctx);
        &self.cache[&symbol]
    }

    /// Price delta expressed in pips of `symbol`
    pub fn to_pips(&mut self, symbol: &str, price_delta: f64) -> f64 {
        self.context(symbol).to_pips(price_delta)
    }

    pub fn known_symbols(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_asset_classes() {
        assert_eq!(AssetClass::classify("EURUSD"), AssetClass::Forex);
        assert_eq!(AssetClass::classify("usdjpy"), AssetClass::Forex);
        assert_eq!(AssetClass::classify("EUR/GBP"), AssetClass::Forex);
        assert_eq!(AssetClass::classify("XAUUSD"), AssetClass::Metal);
        assert_eq!(AssetClass::classify("BTCUSD"), AssetClass::Crypto);
        assert_eq!(AssetClass::classify("NAS100"), AssetClass::Index);
        assert_eq!(AssetClass::classify("BUND10Y"), AssetClass::Bond);
        assert_eq!(AssetClass::classify("SPY.ETF"), AssetClass::Fund);
        assert_eq!(AssetClass::classify("AAPL"), AssetClass::Equity);
    }

    #[test]
    fn test_forex_pip_conversion() {
        let ctx = InstrumentContext::for_symbol("EURUSD");
        assert_eq!(ctx.pip_size, 0.0001);
        assert!((ctx.to_pips(0.0010) - 10.0).abs() < 1e-9);
        let value = ctx.pip_value_per_lot(1.10, "USD").unwrap();
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_jpy_pairs_use_two_decimal_pips() {
        let ctx = InstrumentContext::for_symbol("USDJPY");
        assert_eq!(ctx.pip_size, 0.01);
        assert!((ctx.to_pips(0.25) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_gold_pip_value() {
        let ctx = InstrumentContext::for_symbol("XAUUSD");
        assert_eq!(ctx.asset_class, AssetClass::Metal);
        let value = ctx.pip_value_per_lot(2_300.0, "USD").unwrap();
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_pip_value_converted_to_account_currency() {
        // USD base: 1000 JPY per pip per lot is ~6.67 USD at 150.00
        let usdjpy = InstrumentContext::for_symbol("USDJPY");
        assert!((usdjpy.pip_value_in_quote() - 1_000.0).abs() < 1e-9);
        let value = usdjpy.pip_value_per_lot(150.0, "USD").unwrap();
        assert!((value - 6.666_666_667).abs() < 1e-6);
        assert_eq!(usdjpy.pip_value_per_lot(0.0, "USD"), None);

        // Cross without a rate cannot be valued
        let mut eurgbp = InstrumentContext::for_symbol("EURGBP");
        assert_eq!(eurgbp.pip_value_per_lot(0.85, "USD"), None);
        eurgbp.quote_to_account = Some(1.27);
        let value = eurgbp.pip_value_per_lot(0.85, "USD").unwrap();
        assert!((value - 12.7).abs() < 1e-9);

        // Same pair from a EUR account
        let eurusd = InstrumentContext::for_symbol("EURUSD");
        let value = eurusd.pip_value_per_lot(1.25, "EUR").unwrap();
        assert!((value - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_problems_flag_unusable_properties() {
        assert!(InstrumentContext::for_symbol("EURUSD").validate().is_ok());

        let inverted = InstrumentOverride {
            min_volume: Some(5.0),
            max_volume: Some(1.0),
            ..Default::default()
        }
        .resolve("EURUSD");
        let err = inverted.validate().unwrap_err();
        assert!(err.contains("volume limits"));

        let mut ctx = InstrumentContext::for_symbol("XAUUSD");
        ctx.max_volume = f64::NAN;
        ctx.volume_step = 0.0;
        ctx.quote_to_account = Some(-1.0);
        assert_eq!(ctx.problems().len(), 3);
    }

    #[test]
    fn test_resolver_keys_are_case_insensitive() {
        let mut resolver = PipValueResolver::default();
        let ctx = resolver.context("eurusd").clone();
        assert_eq!(ctx.symbol, "EURUSD");
        resolver.context("EURUSD");
        assert_eq!(resolver.known_symbols(), vec!["EURUSD".to_string()]);
    }

    #[test]
    fn test_resolver_caches_and_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "GER40".to_string(),
            InstrumentOverride {
                min_volume: Some(0.5),
                volume_step: Some(0.5),
                ..Default::default()
            },
        );

        let mut resolver = PipValueResolver::new(overrides);
        let ctx = resolver.context("GER40").clone();
        assert_eq!(ctx.asset_class, AssetClass::Index);
        assert_eq!(ctx.min_volume, 0.5);
        assert_eq!(ctx.volume_step, 0.5);
        assert_eq!(resolver.known_symbols(), vec!["GER40".to_string()]);
    }

    #[test]
    fn test_refresh_replaces_context() {
        let mut resolver = PipValueResolver::default();
        let mut ctx = resolver.context("EURUSD").clone();
        ctx.max_volume = 5.0;

        resolver.refresh(ctx);
        assert_eq!(resolver.context("EURUSD").max_volume, 5.0);
    }
}
