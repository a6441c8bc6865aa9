// src/export.rs
//
// Prospecting export: establishments joined with their company and the
// CNAE, municipality, status and status-reason descriptions, filtered by
// code lists.

use rusqlite::{params_from_iter, types::ValueRef, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use tracing::{info, instrument};

use crate::error::{EtlError, Result};
use crate::schema::layouts::{
    CNAES, EMPRESAS, ESTABELECIMENTOS, MOTIVOS, MUNICIPIOS, SITUACOES, SITUACOES_CADASTRAIS,
};

/// UTF-8 byte order mark, so spreadsheet tools pick the right encoding.
const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Code lists; an empty list does not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProspectFilter {
    pub municipios: Vec<i64>,
    pub situacoes: Vec<i64>,
    pub cnaes: Vec<i64>,
}

struct Lookup {
    table: &'static str,
    alias: &'static str,
    code: &'static str,
    join: &'static str,
    column: &'static str,
    /// Inner joins leave out establishments whose code has no description.
    inner: bool,
    /// Stands in for the table when it was never loaded.
    fallback: Option<&'static [(i64, &'static str)]>,
}

const LOOKUPS: &[Lookup] = &[
    Lookup {
        table: CNAES,
        alias: "c",
        code: "id_cnae",
        join: "c.id_cnae = e.id_cnae",
        column: "descricao_cnae",
        inner: true,
        fallback: None,
    },
    Lookup {
        table: MUNICIPIOS,
        alias: "m",
        code: "id_municipio",
        join: "m.id_municipio = e.id_municipio",
        column: "nome_municipio",
        inner: true,
        fallback: None,
    },
    Lookup {
        table: SITUACOES,
        alias: "sit",
        code: "id_situacao_cadastral",
        join: "sit.id_situacao_cadastral = e.id_situacao_cadastral",
        column: "descricao_situacao_cadastral",
        inner: true,
        fallback: Some(SITUACOES_CADASTRAIS),
    },
    Lookup {
        table: MOTIVOS,
        alias: "mot",
        code: "id_motivo",
        join: "mot.id_motivo = e.motivo_cadastral",
        column: "descricao_motivo",
        inner: false,
        fallback: None,
    },
];

/// Output columns, in order. `{lookup}` entries are resolved per database.
const COLUMNS: &[&str] = &[
    "e.cnpj_basico || e.cnpj_ordem || e.cnpj_dv AS cnpj",
    "e.nome_fantasia",
    "emp.razao_social",
    "{cnaes}",
    "e.bairro",
    "{municipios}",
    "e.tipo_do_logradouro",
    "e.logradouro",
    "e.numero",
    "e.cep",
    "e.complemento",
    "e.ddd1",
    "e.telefone1",
    "e.ddd2",
    "e.telefone2",
    "e.correio_eletronico",
    "e.data_de_inicio_atividade",
    "e.data_situacao_cadastro",
    "emp.capital_social",
    "{situacoes}",
    "{motivos}",
];

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

/// `WITH <table>(<code>, <column>) AS (VALUES ...)` over a fixed code list.
fn fallback_cte(lookup: &Lookup, codes: &[(i64, &str)]) -> String {
    let rows: Vec<String> = codes
        .iter()
        .map(|(code, text)| format!("({code}, '{}')", text.replace('\'', "''")))
        .collect();
    format!(
        "{}({}, {}) AS (VALUES {})",
        lookup.table,
        lookup.code,
        lookup.column,
        rows.join(", ")
    )
}

/// Build the SELECT and its bound parameters.
///
/// CNAE, municipality and status are inner joins, so an establishment whose
/// code has no description is left out. The status-reason join is a left
/// join and never drops rows. A `situacoes` table that was never loaded is
/// replaced by the documented status codes; any other missing lookup yields
/// an empty description column and filters nothing.
fn build_query(conn: &Connection, filter: &ProspectFilter) -> Result<(String, Vec<i64>)> {
    for required in [ESTABELECIMENTOS, EMPRESAS] {
        if !table_exists(conn, required)? {
            return Err(EtlError::config(format!(
                "table `{required}` is not loaded; the export needs it"
            )));
        }
    }

    let mut ctes = Vec::new();
    let mut joins = String::new();
    let mut select = Vec::with_capacity(COLUMNS.len());
    for col in COLUMNS {
        let Some(name) = col.strip_prefix('{').and_then(|c| c.strip_suffix('}')) else {
            select.push(col.to_string());
            continue;
        };
        let lookup = LOOKUPS
            .iter()
            .find(|l| l.table == name)
            .ok_or_else(|| EtlError::State(format!("no lookup named `{name}`")))?;
        let loaded = table_exists(conn, lookup.table)?;
        match (loaded, lookup.fallback) {
            (false, None) => {
                select.push(format!("NULL AS {}", lookup.column));
                continue;
            }
            (false, Some(codes)) => ctes.push(fallback_cte(lookup, codes)),
            (true, _) => {}
        }
        let kind = if lookup.inner { "JOIN" } else { "LEFT JOIN" };
        joins.push_str(&format!(
            "\n{kind} {} {} ON {}",
            lookup.table, lookup.alias, lookup.join
        ));
        select.push(format!("{}.{}", lookup.alias, lookup.column));
    }

    let with = if ctes.is_empty() {
        String::new()
    } else {
        format!("WITH {}\n", ctes.join(",\n     "))
    };
    let mut sql = format!(
        "{with}SELECT {}\nFROM {ESTABELECIMENTOS} e\nJOIN {EMPRESAS} emp ON emp.cnpj_basico = e.cnpj_basico{joins}",
        select.join(",\n    ")
    );

    let mut params = Vec::new();
    let mut conditions = Vec::new();
    for (column, codes) in [
        ("e.id_municipio", &filter.municipios),
        ("e.id_situacao_cadastral", &filter.situacoes),
        ("e.id_cnae", &filter.cnaes),
    ] {
        if codes.is_empty() {
            continue;
        }
        let start = params.len();
        let placeholders: Vec<String> =
            (1..=codes.len()).map(|i| format!("?{}", start + i)).collect();
        conditions.push(format!("{column} IN ({})", placeholders.join(", ")));
        params.extend_from_slice(codes);
    }
    if !conditions.is_empty() {
        sql.push_str("\nWHERE ");
        sql.push_str(&conditions.join("\n  AND "));
    }
    sql.push_str("\nORDER BY e.cnpj_basico, e.cnpj_ordem, e.cnpj_dv");
    Ok((sql, params))
}

fn cell(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

/// Stream the filtered join into `out` as `;`-separated CSV with a header
/// row. Returns the number of data rows written.
pub fn write_prospects<W: Write>(conn: &Connection, filter: &ProspectFilter, mut out: W) -> Result<u64> {
    let (sql, params) = build_query(conn, filter)?;
    out.write_all(BOM)?;
    let mut writer = csv::WriterBuilder::new().delimiter(b';').from_writer(out);

    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let width = names.len();
    writer.write_record(&names)?;

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut written = 0u64;
    let mut record = Vec::with_capacity(width);
    while let Some(row) = rows.next()? {
        record.clear();
        for i in 0..width {
            record.push(cell(row.get_ref(i)?));
        }
        writer.write_record(&record)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Open `db` read-only and export into a new file at `dest`.
#[instrument(level = "info", skip(filter), fields(db = %db.display(), dest = %dest.display()))]
pub fn export_to_path(db: &Path, filter: &ProspectFilter, dest: &Path) -> Result<u64> {
    if !db.exists() {
        return Err(EtlError::source(db, "database does not exist"));
    }
    let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let out = BufWriter::new(File::create(dest)?);
    let rows = write_prospects(&conn, filter, out)?;
    info!(rows, "export written");
    Ok(rows)
}
