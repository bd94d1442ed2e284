//! Partner transaction analysis: resolve a partner's accounts, pull their
//! transactions and aggregate them for charting.

mod chart;

pub use chart::*;

use crate::db::{BoundQuery, ExecutorError, QueryExecutor, ResultTable};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub const ANALYSIS_PREFIX: &str = "analysis";
pub const TOP_COUNTERPARTIES: usize = 10;

const ACCOUNTS_FOR_PARTNER: &str = "SELECT DISTINCT br_to_account.account_id
    FROM partner
    JOIN partner_role ON partner.partner_id = partner_role.partner_id AND partner_role.entity_type = 'BR'
    JOIN business_rel ON partner_role.entity_id = business_rel.br_id
    JOIN br_to_account ON business_rel.br_id = br_to_account.br_id
    WHERE partner.partner_name = $1
    LIMIT 1000";

const TRANSACTIONS_FOR_ACCOUNT: &str = "SELECT \"Transaction ID\", \"Debit/Credit\", \"Account ID\", Amount, Balance, Currency,
        Date, Transfer_Type, counterparty_Account_ID, ext_counterparty_Account_ID, ext_counterparty_country
    FROM transactions
    WHERE \"Account ID\" = $1";

/// Partner name if `question` asks for an analysis, e.g. `analysis ACME AG`.
pub fn analysis_target(question: &str) -> Option<&str> {
    let question = question.trim();
    let prefix = question.get(..ANALYSIS_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(ANALYSIS_PREFIX) {
        Some(question[ANALYSIS_PREFIX.len()..].trim())
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    Start,
    AccountsResolved,
    TransactionsFetched,
    Aggregated,
    Rendered,
}

impl AnalysisStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStage::Start => "start",
            AnalysisStage::AccountsResolved => "accounts_resolved",
            AnalysisStage::TransactionsFetched => "transactions_fetched",
            AnalysisStage::Aggregated => "aggregated",
            AnalysisStage::Rendered => "rendered",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis requires a partner name")]
    MissingPartner,
    #[error("analysis lookup failed: {source}")]
    Lookup {
        stage: AnalysisStage,
        #[source]
        source: ExecutorError,
    },
}

impl AnalysisError {
    pub fn stage(&self) -> AnalysisStage {
        match self {
            AnalysisError::MissingPartner => AnalysisStage::Start,
            AnalysisError::Lookup { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionAnalysis {
    pub partner: String,
    pub accounts: usize,
    pub transactions: usize,
    /// Counterparty country frequencies, most frequent first.
    pub countries: Vec<(String, usize)>,
    /// The most frequent external counterparty accounts.
    pub counterparties: Vec<(String, usize)>,
    pub amounts: Vec<f64>,
}

pub async fn analyze_partner(
    executor: &dyn QueryExecutor,
    partner: &str,
) -> Result<TransactionAnalysis, AnalysisError> {
    if partner.is_empty() {
        return Err(AnalysisError::MissingPartner);
    }

    let accounts = executor
        .execute_bound(BoundQuery::new(ACCOUNTS_FOR_PARTNER, vec![partner.to_string()]))
        .await
        .map_err(|source| AnalysisError::Lookup {
            stage: AnalysisStage::Start,
            source,
        })?;
    let account_ids: Vec<String> = accounts
        .column_values("account_id")
        .map(|values| values.filter_map(scalar_text).collect())
        .unwrap_or_default();
    debug!(stage = %AnalysisStage::AccountsResolved, accounts = account_ids.len(), partner);

    let mut batches = Vec::with_capacity(account_ids.len());
    for account_id in &account_ids {
        let batch = executor
            .execute_bound(BoundQuery::new(TRANSACTIONS_FOR_ACCOUNT, vec![account_id.clone()]))
            .await
            .map_err(|source| AnalysisError::Lookup {
                stage: AnalysisStage::AccountsResolved,
                source,
            })?;
        batches.push(batch);
    }
    debug!(stage = %AnalysisStage::TransactionsFetched, batches = batches.len());

    let analysis = aggregate(partner, account_ids.len(), &batches);
    debug!(
        stage = %AnalysisStage::Aggregated,
        transactions = analysis.transactions,
        countries = analysis.countries.len()
    );
    Ok(analysis)
}

pub fn aggregate(partner: &str, accounts: usize, batches: &[ResultTable]) -> TransactionAnalysis {
    let mut countries = HashMap::new();
    let mut counterparties = HashMap::new();
    let mut amounts = Vec::new();
    let mut transactions = 0;

    for batch in batches {
        transactions += batch.row_count;
        if let Some(values) = batch.column_values("ext_counterparty_country") {
            tally(&mut countries, values);
        }
        if let Some(values) = batch.column_values("ext_counterparty_Account_ID") {
            tally(&mut counterparties, values);
        }
        if let Some(values) = batch.column_values("Amount") {
            amounts.extend(values.filter_map(scalar_number));
        }
    }

    let mut counterparties = ranked(counterparties);
    counterparties.truncate(TOP_COUNTERPARTIES);

    TransactionAnalysis {
        partner: partner.to_string(),
        accounts,
        transactions,
        countries: ranked(countries),
        counterparties,
        amounts,
    }
}

fn tally<'a>(counts: &mut HashMap<String, usize>, values: impl Iterator<Item = &'a Value>) {
    for label in values.filter_map(scalar_text) {
        *counts.entry(label).or_default() += 1;
    }
}

/// Descending by count, ties broken by label.
fn ranked(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn scalar_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|f| f.is_finite())
}
