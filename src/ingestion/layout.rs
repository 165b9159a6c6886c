//! Field layouts for the exchange trade files
//!
//! Two schemas are observed for the same file family. Both decode through
//! `RecordLayout::decode` so the parser never cares which one is active.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use csv_async::StringRecord;
use rust_decimal::Decimal;
use std::{fmt, str::FromStr};

use crate::{error::RecordErrorKind, models::Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// `HoraFechamento;DataNegocio;CodigoInstrumento;PrecoNegocio;QuantidadeNegociada`
    Compact,
    /// `DataReferencia;CodigoInstrumento;AcaoAtualizacao;PrecoNegocio;
    /// QuantidadeNegociada;HoraFechamento;CodigoIdentificadorNegocio;
    /// TipoSessaoPregao;DataNegocio;CodigoParticipanteComprador;
    /// CodigoParticipanteVendedor`
    Intraday,
}

struct Columns {
    closing_time: usize,
    trade_date: usize,
    ticker: usize,
    price: usize,
    quantity: usize,
}

const COMPACT: Columns = Columns {
    closing_time: 0,
    trade_date: 1,
    ticker: 2,
    price: 3,
    quantity: 4,
};

const INTRADAY: Columns = Columns {
    closing_time: 5,
    trade_date: 8,
    ticker: 1,
    price: 3,
    quantity: 4,
};

impl RecordLayout {
    pub fn required_columns(self) -> usize {
        match self {
            Self::Compact => 5,
            Self::Intraday => 11,
        }
    }

    fn columns(self) -> &'static Columns {
        match self {
            Self::Compact => &COMPACT,
            Self::Intraday => &INTRADAY,
        }
    }

    pub fn decode(
        self,
        record: &StringRecord,
        created_at: DateTime<Utc>,
    ) -> Result<Trade, RecordErrorKind> {
        let required = self.required_columns();
        if record.len() < required {
            return Err(RecordErrorKind::TooFewColumns {
                required,
                found: record.len(),
            });
        }

        let cols = self.columns();
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();

        let trade_date = parse_trade_date(field(cols.trade_date))?;
        let ticker = field(cols.ticker);
        if ticker.is_empty() {
            return Err(RecordErrorKind::EmptyTicker);
        }

        Ok(Trade {
            closing_time: parse_closing_time(field(cols.closing_time), trade_date),
            trade_date,
            ticker: ticker.to_string(),
            price: parse_price(field(cols.price))?,
            quantity: parse_quantity(field(cols.quantity))?,
            created_at,
        })
    }
}

impl FromStr for RecordLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "5" => Ok(Self::Compact),
            "intraday" | "11" => Ok(Self::Intraday),
            other => Err(anyhow::anyhow!(
                "unknown record layout {:?} (expected compact or intraday)",
                other
            )),
        }
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compact => write!(f, "compact"),
            Self::Intraday => write!(f, "intraday"),
        }
    }
}

/// Substituted for closing times that are empty or unparseable.
pub fn sentinel_closing_time() -> NaiveDateTime {
    NaiveDateTime::default()
}

fn parse_trade_date(raw: &str) -> Result<NaiveDate, RecordErrorKind> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .map_err(|_| RecordErrorKind::InvalidDate(raw.to_string()))
}

/// Comma is the decimal separator in exchange files.
fn parse_price(raw: &str) -> Result<Decimal, RecordErrorKind> {
    let normalized = raw.replace(',', ".");
    Decimal::from_str(&normalized).map_err(|_| RecordErrorKind::InvalidPrice(raw.to_string()))
}

fn parse_quantity(raw: &str) -> Result<i64, RecordErrorKind> {
    raw.parse::<i64>()
        .map_err(|_| RecordErrorKind::InvalidQuantity(raw.to_string()))
}

/// Closing time is informational, so anything undecodable maps to the
/// sentinel instead of rejecting the record.
pub fn parse_closing_time(raw: &str, trade_date: NaiveDate) -> NaiveDateTime {
    decode_time(raw)
        .map(|t| trade_date.and_time(t))
        .unwrap_or_else(sentinel_closing_time)
}

fn decode_time(raw: &str) -> Option<NaiveTime> {
    if raw.contains(':') {
        return NaiveTime::parse_from_str(raw, "%H:%M:%S%.f").ok();
    }
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let num = |range: std::ops::Range<usize>| raw[range].parse::<u32>().ok();
    let milli = match raw.len() {
        6 => 0,
        8 => num(6..8)? * 10,
        9 => num(6..9)?,
        _ => return None,
    };
    NaiveTime::from_hms_milli_opt(num(0..2)?, num(2..4)?, num(4..6)?, milli)
}
