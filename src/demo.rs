//! A small in-memory market used by `--memory`. It mirrors part of the seed
//! migration so commands can be tried without a database.

use chrono::NaiveDate;
use core_types::{Account, AssetClass, Instrument, Position, Quote};
use database::MemoryRepository;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const ACCOUNTS: [(i64, &str, &str, Decimal); 4] = [
    (1, "emiliano@test.com", "10001", dec!(1000000)),
    (2, "jose@test.com", "10002", dec!(500000)),
    (3, "francisco@test.com", "10003", dec!(750000)),
    (4, "juan@test.com", "10004", dec!(250000)),
];

// (id, ticker, name, close, previous close)
const EQUITIES: [(i64, &str, &str, Decimal, Decimal); 6] = [
    (31, "BMA", "Banco Macro S.A.", dec!(1520.25), dec!(1413.50)),
    (35, "DGCU2", "Distribuidora De Gas Cuyano S.A.", dec!(341.50), dec!(335.00)),
    (37, "CGPA2", "Camuzzi Gas del Sur", dec!(400.50), dec!(408.00)),
    (47, "PAMP", "Pampa Holding S.A.", dec!(925.85), dec!(921.50)),
    (50, "YPFD", "Y.P.F. S.A.", dec!(1063.25), dec!(1058.50)),
    (60, "CEPU", "Central Puerto", dec!(364.80), dec!(353.45)),
];

pub async fn seeded_repository(cash_instrument_id: i64) -> MemoryRepository {
    let repo = MemoryRepository::new();
    let date = NaiveDate::from_ymd_opt(2023, 7, 13).unwrap_or_default();

    for (id, email, account_number, balance) in ACCOUNTS {
        repo.add_account(Account {
            id,
            email: email.to_string(),
            account_number: account_number.to_string(),
        })
        .await;
        let mut cash = Position::empty_cash(id, cash_instrument_id);
        cash.quantity = balance;
        cash.market_value = balance;
        repo.seed_position(cash).await;
    }

    repo.add_instrument(Instrument {
        id: cash_instrument_id,
        ticker: "ARS".to_string(),
        name: "PESOS".to_string(),
        asset_class: AssetClass::Cash,
    })
    .await;

    for (id, ticker, name, close, previous_close) in EQUITIES {
        repo.add_instrument(Instrument {
            id,
            ticker: ticker.to_string(),
            name: name.to_string(),
            asset_class: AssetClass::Equity,
        })
        .await;
        repo.add_quote(Quote {
            instrument_id: id,
            date,
            open: None,
            high: None,
            low: None,
            close,
            previous_close: Some(previous_close),
        })
        .await;
    }

    repo
}
