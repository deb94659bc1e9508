//! REST kline fetches used for bootstrap and reconnect backfill.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use skiff_core::{normalize_symbol, Candle, Interval};

use crate::StreamError;

/// Hard cap on bars per REST request, matching the venue page size.
pub const MAX_BOOTSTRAP_BARS: usize = 500;

pub(crate) fn build_client(timeout: Duration) -> Result<Client, StreamError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| StreamError::Transport(err.to_string()))
}

/// Fetch the most recent `limit` closed bars for a symbol.
pub async fn fetch_klines(
    http: &Client,
    rest_url: &str,
    symbol_code: &str,
    interval: Interval,
    limit: usize,
) -> Result<Vec<Candle>, StreamError> {
    let limit = limit.clamp(1, MAX_BOOTSTRAP_BARS);
    let url = format!(
        "{}/api/v3/klines?symbol={}&interval={}&limit={}",
        rest_url.trim_end_matches('/'),
        symbol_code.to_uppercase(),
        interval.label(),
        limit
    );
    let rows: Vec<Value> = http
        .get(&url)
        .send()
        .await
        .map_err(transport_error)?
        .error_for_status()
        .map_err(transport_error)?
        .json()
        .await
        .map_err(|err| StreamError::Parse(err.to_string()))?;
    let mut candles = Vec::with_capacity(rows.len());
    for row in &rows {
        candles.push(parse_kline_row(symbol_code, interval, row)?);
    }
    Ok(candles)
}

fn transport_error(err: reqwest::Error) -> StreamError {
    if err.is_timeout() {
        StreamError::Timeout
    } else {
        StreamError::Transport(err.to_string())
    }
}

/// Decode one `[open_time, o, h, l, c, v, close_time, ...]` row.
pub(crate) fn parse_kline_row(
    symbol_code: &str,
    interval: Interval,
    row: &Value,
) -> Result<Candle, StreamError> {
    let fields = row
        .as_array()
        .filter(|fields| fields.len() >= 6)
        .ok_or_else(|| StreamError::Parse(format!("malformed kline row: {row}")))?;
    let open_time = fields[0]
        .as_i64()
        .ok_or_else(|| StreamError::Parse("kline open time is not an integer".into()))?;
    let timestamp = timestamp_from_ms(open_time)?;
    Ok(Candle {
        symbol: normalize_symbol(symbol_code),
        interval,
        open: decimal_field(&fields[1], "open")?,
        high: decimal_field(&fields[2], "high")?,
        low: decimal_field(&fields[3], "low")?,
        close: decimal_field(&fields[4], "close")?,
        volume: decimal_field(&fields[5], "volume")?,
        timestamp,
    })
}

pub(crate) fn decimal_field(value: &Value, name: &str) -> Result<Decimal, StreamError> {
    let text = value
        .as_str()
        .ok_or_else(|| StreamError::Parse(format!("kline {name} is not a string")))?;
    Decimal::from_str(text)
        .map_err(|err| StreamError::Parse(format!("kline {name} '{text}': {err}")))
}

pub(crate) fn timestamp_from_ms(ms: i64) -> Result<DateTime<Utc>, StreamError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StreamError::Parse(format!("timestamp {ms} out of range")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_a_standard_kline_row() {
        let row = json!([
            1_777_723_200_000_i64,
            "60000.5",
            "60100.0",
            "59950.25",
            "60050.0",
            "12.5",
            1_777_723_259_999_i64
        ]);
        let candle = parse_kline_row("BTCUSDT", Interval::OneMinute, &row).unwrap();
        assert_eq!(candle.symbol, "BTC-USDC");
        assert_eq!(candle.close, Decimal::new(600_500, 1));
        assert_eq!(candle.timestamp.timestamp_millis(), 1_777_723_200_000);
    }

    #[test]
    fn rejects_rows_with_missing_fields() {
        let row = json!([1_777_723_200_000_i64, "60000.5"]);
        assert!(matches!(
            parse_kline_row("BTCUSDT", Interval::OneMinute, &row),
            Err(StreamError::Parse(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_prices() {
        let row = json!([1_777_723_200_000_i64, "x", "1", "1", "1", "1"]);
        assert!(parse_kline_row("BTCUSDT", Interval::OneMinute, &row).is_err());
    }
}
