//! Static city metadata for the six settlement cities.
//!
//! The settlement station is the one Kalshi uses to resolve the market; the
//! surrounding stations feed the trend adjustments in the estimator.

/// A tradeable city: stations, coordinates, and Kalshi series tickers.
#[derive(Debug, Clone, Copy)]
pub struct City {
    pub code: &'static str,
    /// Settlement station (primary observation source).
    pub primary: &'static str,
    pub surrounding: &'static [&'static str],
    pub lat: f64,
    pub lon: f64,
    /// Series ticker for daily-high markets, e.g. "KXHIGHNY".
    pub kalshi_high: Option<&'static str>,
    /// Series ticker for daily-low markets.
    pub kalshi_low: Option<&'static str>,
}

pub static CITIES: &[City] = &[
    City {
        code: "NYC",
        primary: "KNYC",
        surrounding: &["KLGA", "KJFK", "KEWR", "KTEB"],
        lat: 40.7128,
        lon: -74.0060,
        kalshi_high: Some("KXHIGHNY"),
        kalshi_low: Some("KXLOWTNYC"),
    },
    City {
        code: "PHI",
        primary: "KPHL",
        surrounding: &["KPNE", "KILG", "KTTN"],
        lat: 39.9526,
        lon: -75.1652,
        kalshi_high: Some("KXHIGHPHIL"),
        kalshi_low: Some("KXLOWTPHIL"),
    },
    City {
        code: "MIA",
        primary: "KMIA",
        surrounding: &["KFLL", "KOPF", "KTMB"],
        lat: 25.7617,
        lon: -80.1918,
        kalshi_high: Some("KXHIGHMIA"),
        kalshi_low: Some("KXLOWTMIA"),
    },
    City {
        code: "BOS",
        primary: "KBOS",
        surrounding: &["KBED", "KOWD", "KBVY"],
        lat: 42.3601,
        lon: -71.0589,
        kalshi_high: Some("KXHIGHTBOS"),
        kalshi_low: None,
    },
    City {
        code: "DC",
        primary: "KDCA",
        surrounding: &["KIAD", "KBWI", "KADW"],
        lat: 38.9072,
        lon: -77.0369,
        kalshi_high: Some("KXHIGHTDC"),
        kalshi_low: None,
    },
    City {
        code: "ATL",
        primary: "KATL",
        surrounding: &["KPDK", "KFTY", "KMGE"],
        lat: 33.7490,
        lon: -84.3880,
        kalshi_high: Some("KXHIGHTATL"),
        kalshi_low: None,
    },
];

/// Cities whose signals get a priority boost (most profitable historically).
pub static PREFERRED_CITIES: &[&str] = &["MIA", "NYC"];

pub fn all() -> &'static [City] {
    CITIES
}

pub fn get(code: &str) -> Option<&'static City> {
    CITIES.iter().find(|c| c.code == code)
}

/// Resolve a city by its settlement station.
pub fn by_station(station: &str) -> Option<&'static City> {
    CITIES.iter().find(|c| c.primary == station)
}

/// Resolve a city by one of its Kalshi series tickers. Returns the city and
/// whether the series is the high-temp one.
pub fn by_series(series: &str) -> Option<(&'static City, bool)> {
    for city in CITIES {
        if city.kalshi_high == Some(series) {
            return Some((city, true));
        }
        if city.kalshi_low == Some(series) {
            return Some((city, false));
        }
    }
    None
}

/// Forecast-undershoot bias for daily highs, calibrated from prediction
/// residuals. Positive = actual runs hotter than forecast.
pub fn high_bias(code: &str) -> f64 {
    match code {
        "MIA" => 5.0,
        "ATL" => 5.0,
        "NYC" => 3.0,
        _ => 0.0,
    }
}

/// Forecast-overshoot bias for daily lows. Negative = actual runs colder.
pub fn low_bias(code: &str) -> f64 {
    match code {
        "MIA" => -6.0,
        "NYC" => -4.0,
        _ => 0.0,
    }
}

/// Per-city standard-deviation floor from prediction accuracy analysis.
pub fn sigma_floor(code: &str) -> f64 {
    match code {
        "ATL" => 5.0,
        "MIA" => 4.5,
        "NYC" => 3.5,
        "DC" => 3.5,
        "BOS" => 2.5,
        "PHI" => 2.5,
        _ => 3.0,
    }
}

pub fn is_preferred(code: &str) -> bool {
    PREFERRED_CITIES.contains(&code)
}
