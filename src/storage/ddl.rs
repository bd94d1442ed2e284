use anyhow::{Context, Result};
use rusqlite::Connection;

/// How a CSV cell is converted before insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Text,
    Date,
    DateTime,
    Numeric,
}

#[derive(Debug)]
pub struct TableSpec {
    pub name: &'static str,
    /// Columns a CSV may supply, in DDL order. Surrogate keys are omitted.
    pub columns: &'static [(&'static str, Coercion)],
    pub ddl: &'static str,
}

impl TableSpec {
    pub fn coercion(&self, column: &str) -> Option<Coercion> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, c)| *c)
    }

    pub fn csv_file(&self) -> String {
        format!("{}.csv", self.name)
    }
}

use Coercion::*;

pub const BANK_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "account",
        columns: &[
            ("account_id", Text),
            ("account_iban", Text),
            ("account_currency", Text),
            ("account_open_date", Date),
            ("account_close_date", Date),
        ],
        ddl: "
        DROP TABLE IF EXISTS account;
        CREATE TABLE account (
            account_id TEXT PRIMARY KEY,
            account_iban TEXT,
            account_currency TEXT,
            account_open_date DATE,
            account_close_date DATE
        );",
    },
    TableSpec {
        name: "business_rel",
        columns: &[("br_id", Text), ("br_open_date", Date), ("br_close_date", Date)],
        ddl: "
        DROP TABLE IF EXISTS business_rel;
        CREATE TABLE business_rel (
            br_id TEXT PRIMARY KEY,
            br_open_date DATE,
            br_close_date DATE
        );",
    },
    TableSpec {
        name: "br_to_account",
        columns: &[
            ("br_id", Text),
            ("account_id", Text),
            ("relationship_id", Text),
            ("relationship_status_code", Numeric),
        ],
        ddl: "
        DROP TABLE IF EXISTS br_to_account;
        CREATE TABLE br_to_account (
            br_id TEXT,
            account_id TEXT,
            relationship_id TEXT,
            relationship_status_code INTEGER,
            PRIMARY KEY (br_id, account_id),
            FOREIGN KEY (br_id) REFERENCES business_rel(br_id),
            FOREIGN KEY (account_id) REFERENCES account(account_id)
        );",
    },
    TableSpec {
        name: "partner",
        columns: &[
            ("partner_id", Text),
            ("industry_gic2_code", Text),
            ("partner_class_code", Text),
            ("partner_gender", Text),
            ("partner_name", Text),
            ("partner_phone_number", Text),
            ("partner_birth_year", Date),
            ("partner_address", Text),
            ("partner_open_date", Date),
            ("partner_close_date", Date),
        ],
        ddl: "
        DROP TABLE IF EXISTS partner;
        CREATE TABLE partner (
            partner_id TEXT PRIMARY KEY,
            industry_gic2_code TEXT,
            partner_class_code TEXT,
            partner_gender TEXT,
            partner_name TEXT,
            partner_phone_number TEXT,
            partner_birth_year DATE,
            partner_address TEXT,
            partner_open_date DATE,
            partner_close_date DATE
        );",
    },
    TableSpec {
        name: "client_onboarding_notes",
        columns: &[("Partner_ID", Text), ("Onboarding_Note", Text)],
        ddl: "
        DROP TABLE IF EXISTS client_onboarding_notes;
        CREATE TABLE client_onboarding_notes (
            Partner_ID TEXT PRIMARY KEY,
            Onboarding_Note TEXT,
            FOREIGN KEY (Partner_ID) REFERENCES partner(partner_id)
        );",
    },
    TableSpec {
        name: "partner_country",
        columns: &[
            ("partner_id", Text),
            ("country_type", Text),
            ("country_name", Text),
            ("partner_country_status_code", Numeric),
        ],
        ddl: "
        DROP TABLE IF EXISTS partner_country;
        CREATE TABLE partner_country (
            partner_id TEXT,
            country_type TEXT,
            country_name TEXT,
            partner_country_status_code INTEGER,
            PRIMARY KEY (partner_id, country_type),
            FOREIGN KEY (partner_id) REFERENCES partner(partner_id)
        );",
    },
    TableSpec {
        name: "partner_role",
        columns: &[
            ("partner_id", Text),
            ("entity_type", Text),
            ("entity_id", Text),
            ("relationship_start_date", Date),
            ("relationship_end_date", Date),
            ("br_type_code", Text),
            ("associated_partner_id", Text),
            ("partner_class_code", Text),
        ],
        ddl: "
        DROP TABLE IF EXISTS partner_role;
        CREATE TABLE partner_role (
            partner_id TEXT,
            entity_type TEXT,
            entity_id TEXT,
            relationship_start_date DATE,
            relationship_end_date DATE,
            br_type_code TEXT,
            associated_partner_id TEXT,
            partner_class_code TEXT,
            PRIMARY KEY (partner_id, entity_id, br_type_code),
            FOREIGN KEY (partner_id) REFERENCES partner(partner_id),
            FOREIGN KEY (associated_partner_id) REFERENCES partner(partner_id)
        );",
    },
    TableSpec {
        name: "transactions",
        columns: &[
            ("Transaction ID", Text),
            ("Debit/Credit", Text),
            ("Account ID", Text),
            ("Amount", Numeric),
            ("Balance", Numeric),
            ("Currency", Text),
            ("Date", DateTime),
            ("Transfer_Type", Text),
            ("counterparty_Account_ID", Text),
            ("ext_counterparty_Account_ID", Text),
            ("ext_counterparty_country", Text),
        ],
        ddl: "
        DROP TABLE IF EXISTS transactions;
        CREATE TABLE transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            \"Transaction ID\" TEXT,
            \"Debit/Credit\" TEXT,
            \"Account ID\" TEXT,
            Amount REAL,
            Balance REAL,
            Currency TEXT,
            Date TIMESTAMP,
            Transfer_Type TEXT,
            counterparty_Account_ID TEXT,
            ext_counterparty_Account_ID TEXT,
            ext_counterparty_country TEXT,
            FOREIGN KEY (\"Account ID\") REFERENCES account(account_id),
            FOREIGN KEY (counterparty_Account_ID) REFERENCES account(account_id)
        );",
    },
];

/// Drops and recreates every bank table.
pub fn create_bank_tables(conn: &Connection) -> Result<()> {
    for table in BANK_TABLES {
        conn.execute_batch(table.ddl)
            .with_context(|| format!("failed to create table {}", table.name))?;
    }
    Ok(())
}
