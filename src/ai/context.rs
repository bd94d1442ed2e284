use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema context sent to the model. Never contains row data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<TableContext>,
    pub semantics: SemanticLayer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableContext {
    pub name: String,
    pub columns: Vec<ColumnContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnContext {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Business meaning attached to tables and columns, plus global rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticLayer {
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSemantics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSemantics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

/// A column entry in `schema.json`: either a bare type or a typed object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ColumnSpec {
    Type(String),
    Detailed {
        #[serde(rename = "type")]
        data_type: String,
        #[serde(default = "default_nullable")]
        nullable: bool,
    },
}

fn default_nullable() -> bool {
    true
}

/// `schema.json` keeps declaration order so prompts list columns as the DDL does.
type SchemaFile = serde_json::Map<String, serde_json::Value>;

impl SchemaContext {
    pub fn new(tables: Vec<TableContext>, semantics: SemanticLayer) -> Self {
        Self { tables, semantics }
    }

    /// Parse the table → column → type document.
    pub fn tables_from_json(json: &str) -> Result<Vec<TableContext>> {
        let file: SchemaFile = serde_json::from_str(json).context("schema JSON is not an object")?;
        let mut tables = Vec::with_capacity(file.len());
        for (table, columns) in file {
            let columns = columns
                .as_object()
                .with_context(|| format!("columns of table '{table}' must be an object"))?;
            let mut cols = Vec::with_capacity(columns.len());
            for (name, spec) in columns {
                let spec: ColumnSpec = serde_json::from_value(spec.clone())
                    .with_context(|| format!("invalid column spec for {table}.{name}"))?;
                let (data_type, nullable) = match spec {
                    ColumnSpec::Type(t) => (t, true),
                    ColumnSpec::Detailed { data_type, nullable } => (data_type, nullable),
                };
                cols.push(ColumnContext {
                    name: name.clone(),
                    data_type,
                    nullable,
                });
            }
            tables.push(TableContext { name: table, columns: cols });
        }
        Ok(tables)
    }

    pub fn semantics_from_json(json: &str) -> Result<SemanticLayer> {
        serde_json::from_str(json).context("semantic layer JSON does not match the expected shape")
    }

    /// Load both static documents. A missing semantic file yields an empty layer.
    pub fn load(schema_path: &Path, semantic_path: &Path) -> Result<Self> {
        let schema = std::fs::read_to_string(schema_path)
            .with_context(|| format!("failed to read {}", schema_path.display()))?;
        let tables = Self::tables_from_json(&schema)?;
        Ok(Self::new(tables, Self::load_semantics(semantic_path)?))
    }

    pub fn load_semantics(path: &Path) -> Result<SemanticLayer> {
        if !path.exists() {
            return Ok(SemanticLayer::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::semantics_from_json(&raw)
    }

    pub fn to_ddl_summary(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            if let Some(desc) = self
                .semantics
                .tables
                .get(&table.name)
                .and_then(|s| s.description.as_deref())
            {
                out.push_str(&format!("-- {}\n", desc));
            }
            out.push_str(&format!("CREATE TABLE {} (\n", table.name));
            for (i, col) in table.columns.iter().enumerate() {
                let mut parts = vec![format!("  {} {}", quote_if_needed(&col.name), col.data_type)];
                if !col.nullable {
                    parts.push("NOT NULL".into());
                }
                let suffix = if i + 1 < table.columns.len() { "," } else { "" };
                out.push_str(&format!("{}{}\n", parts.join(" "), suffix));
            }
            out.push_str(")\n\n");
        }
        out
    }

    pub fn semantics_json(&self) -> String {
        serde_json::to_string_pretty(&self.semantics).unwrap_or_else(|_| "{}".into())
    }
}

/// Column names such as `"Account ID"` must be quoted to be usable verbatim.
fn quote_if_needed(name: &str) -> String {
    let plain = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}
