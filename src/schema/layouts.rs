// src/schema/layouts.rs
//
// Documented column order of the Receita Federal CNPJ files. The files carry
// no header line; position is the only link between a field and its name.

use super::types::{ColumnSpec, ColumnType};
use super::TableDef;

pub const EMPRESAS: &str = "empresas";
pub const ESTABELECIMENTOS: &str = "estabelecimentos";
pub const CNAES: &str = "cnaes";
pub const MUNICIPIOS: &str = "municipios";
pub const MOTIVOS: &str = "motivos";
pub const SITUACOES: &str = "situacoes";

pub const BUILTIN_TABLES: &[&str] = &[
    EMPRESAS,
    ESTABELECIMENTOS,
    CNAES,
    MUNICIPIOS,
    MOTIVOS,
    SITUACOES,
];

/// Registration status codes (`id_situacao_cadastral`) as documented by the
/// RFB. No open-data file carries them, so the `situacoes` table is loaded
/// from a user file or falls back to this list.
pub const SITUACOES_CADASTRAIS: &[(i64, &str)] = &[
    (1, "NULA"),
    (2, "ATIVA"),
    (3, "SUSPENSA"),
    (4, "INAPTA"),
    (8, "BAIXADA"),
];

const EMPRESAS_LAYOUT: &[&str] = &[
    "cnpj_basico",
    "razao_social",
    "natureza_juridica",
    "qualificacao_responsavel",
    "capital_social",
    "porte_empresa",
    "ente_federativo_responsavel",
];

const ESTABELECIMENTOS_LAYOUT: &[&str] = &[
    "cnpj_basico",
    "cnpj_ordem",
    "cnpj_dv",
    "identificador_matriz_filial",
    "nome_fantasia",
    "id_situacao_cadastral",
    "data_situacao_cadastro",
    "motivo_cadastral",
    "nome_da_cidade_no_exterior",
    "pais",
    "data_de_inicio_atividade",
    "id_cnae",
    "cnae_fiscal_secundaria",
    "tipo_do_logradouro",
    "logradouro",
    "numero",
    "complemento",
    "bairro",
    "cep",
    "uf",
    "id_municipio",
    "ddd1",
    "telefone1",
    "ddd2",
    "telefone2",
    "ddd_do_fax",
    "fax",
    "correio_eletronico",
    "situacao_especial",
    "data_da_situacao_especial",
];

/// Built-in definition for one of the RFB source types.
pub fn builtin(name: &str) -> Option<TableDef> {
    let def = match name {
        EMPRESAS => TableDef {
            name: EMPRESAS.into(),
            layout: owned(EMPRESAS_LAYOUT),
            columns: vec![
                ColumnSpec::fixed("cnpj_basico", 8).required(),
                ColumnSpec::new("razao_social", ColumnType::Text),
                ColumnSpec::new("natureza_juridica", ColumnType::Integer),
                ColumnSpec::new("qualificacao_responsavel", ColumnType::Integer),
                ColumnSpec::new("capital_social", ColumnType::Real),
                ColumnSpec::new("porte_empresa", ColumnType::Text),
                ColumnSpec::new("ente_federativo_responsavel", ColumnType::Text),
            ],
            key: owned(&["cnpj_basico"]),
            indexes: owned(&["cnpj_basico"]),
            has_headers: false,
            member_suffix: Some("EMPRECSV".into()),
        },
        ESTABELECIMENTOS => TableDef {
            name: ESTABELECIMENTOS.into(),
            layout: owned(ESTABELECIMENTOS_LAYOUT),
            columns: estabelecimentos_columns(),
            key: owned(&["cnpj_basico", "cnpj_ordem", "cnpj_dv"]),
            indexes: owned(&["cnpj_basico", "id_cnae", "id_municipio", "uf"]),
            has_headers: false,
            member_suffix: Some("ESTABELE".into()),
        },
        CNAES => lookup(CNAES, "id_cnae", "descricao_cnae", Some("CNAECSV")),
        MUNICIPIOS => lookup(MUNICIPIOS, "id_municipio", "nome_municipio", Some("MUNICCSV")),
        MOTIVOS => lookup(MOTIVOS, "id_motivo", "descricao_motivo", Some("MOTICSV")),
        SITUACOES => lookup(
            SITUACOES,
            "id_situacao_cadastral",
            "descricao_situacao_cadastral",
            None,
        ),
        _ => return None,
    };
    Some(def)
}

fn estabelecimentos_columns() -> Vec<ColumnSpec> {
    use ColumnType::*;

    let mut cols = vec![
        ColumnSpec::fixed("cnpj_basico", 8).required(),
        ColumnSpec::fixed("cnpj_ordem", 4).required(),
        ColumnSpec::fixed("cnpj_dv", 2).required(),
    ];
    // Phone parts stay text: leading zeros matter.
    let rest: &[(&str, ColumnType)] = &[
        ("identificador_matriz_filial", Integer),
        ("nome_fantasia", Text),
        ("id_situacao_cadastral", Integer),
        ("data_situacao_cadastro", Date),
        ("motivo_cadastral", Integer),
        ("nome_da_cidade_no_exterior", Text),
        ("pais", Integer),
        ("data_de_inicio_atividade", Date),
        ("id_cnae", Integer),
        ("cnae_fiscal_secundaria", Text),
        ("tipo_do_logradouro", Text),
        ("logradouro", Text),
        ("numero", Text),
        ("complemento", Text),
        ("bairro", Text),
    ];
    cols.extend(rest.iter().map(|(n, t)| ColumnSpec::new(n, *t)));
    cols.push(ColumnSpec::fixed("cep", 8));
    let tail: &[(&str, ColumnType)] = &[
        ("uf", Text),
        ("id_municipio", Integer),
        ("ddd1", Text),
        ("telefone1", Text),
        ("ddd2", Text),
        ("telefone2", Text),
        ("ddd_do_fax", Text),
        ("fax", Text),
        ("correio_eletronico", Text),
        ("situacao_especial", Text),
        ("data_da_situacao_especial", Date),
    ];
    cols.extend(tail.iter().map(|(n, t)| ColumnSpec::new(n, *t)));
    cols
}

/// Code/description pairs (CNAE, municipality, status, status reason).
fn lookup(name: &str, code: &str, description: &str, member_suffix: Option<&str>) -> TableDef {
    TableDef {
        name: name.into(),
        layout: owned(&[code, description]),
        columns: vec![
            ColumnSpec::new(code, ColumnType::Integer).required(),
            ColumnSpec::new(description, ColumnType::Text),
        ],
        key: owned(&[code]),
        indexes: Vec::new(),
        has_headers: false,
        member_suffix: member_suffix.map(String::from),
    }
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_selects_its_whole_layout() {
        for name in BUILTIN_TABLES {
            let def = builtin(name).expect("builtin exists");
            let selected: Vec<&str> = def.columns.iter().map(|c| c.name.as_str()).collect();
            let layout: Vec<&str> = def.layout.iter().map(String::as_str).collect();
            assert_eq!(selected, layout, "{name}");
        }
    }

    #[test]
    fn estabelecimentos_has_thirty_fields() {
        let def = builtin(ESTABELECIMENTOS).unwrap();
        assert_eq!(def.layout.len(), 30);
        assert_eq!(def.key.len(), 3);
    }

    #[test]
    fn situacoes_is_a_code_lookup() {
        let def = builtin(SITUACOES).unwrap();
        assert_eq!(def.layout, ["id_situacao_cadastral", "descricao_situacao_cadastral"]);
        assert_eq!(def.key, ["id_situacao_cadastral"]);
        assert!(def.member_suffix.is_none());
        assert!(SITUACOES_CADASTRAIS.contains(&(8, "BAIXADA")));
    }

    #[test]
    fn unknown_table_has_no_builtin() {
        assert!(builtin("socios_extra").is_none());
    }
}
