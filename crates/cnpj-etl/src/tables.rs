//! The ten logical source tables.
//!
//! Each table pairs a CSV glob pattern with its fixed, ordered column list.
//! Everything is transported as text; interpretation happens at projection
//! time only. The four large tables are partitioned on the identifier prefix.

use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};

/// Hive partition column for the four partitioned tables.
pub const PARTITION_COLUMN: &str = "cnpj_prefix";

pub struct TableSpec {
    pub name: &'static str,
    pub glob: &'static str,
    pub columns: &'static [&'static str],
    pub partitioned: bool,
}

impl TableSpec {
    /// All-text, nullable arrow schema in declared column order.
    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|name| Field::new(*name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ))
    }
}

pub const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "empresa",
        glob: "*EMPRECSV*",
        columns: &[
            "cnpj_basico",
            "razao_social",
            "natureza_juridica",
            "qualificacao_responsavel",
            "capital_social",
            "porte_empresa",
            "ente_federativo",
        ],
        partitioned: true,
    },
    TableSpec {
        name: "estabelecimento",
        glob: "*ESTABELE*",
        columns: &[
            "cnpj_basico",
            "cnpj_ordem",
            "cnpj_dv",
            "identificador_matriz_filial",
            "nome_fantasia",
            "situacao_cadastral",
            "data_situacao_cadastral",
            "motivo_situacao_cadastral",
            "nome_cidade_exterior",
            "codigo_pais",
            "data_inicio_atividade",
            "cnae_principal",
            "cnaes_secundarios",
            "tipo_logradouro",
            "logradouro",
            "numero",
            "complemento",
            "bairro",
            "cep",
            "uf",
            "codigo_municipio",
            "ddd1",
            "telefone1",
            "ddd2",
            "telefone2",
            "ddd_fax",
            "fax",
            "correio_eletronico",
            "situacao_especial",
            "data_situacao_especial",
        ],
        partitioned: true,
    },
    TableSpec {
        name: "socio",
        glob: "*SOCIOCSV*",
        columns: &[
            "cnpj_basico",
            "identificador_socio",
            "nome_socio",
            "cnpj_cpf_socio",
            "qualificacao_socio",
            "data_entrada_sociedade",
            "codigo_pais",
            "representante_legal",
            "nome_representante",
            "qualificacao_representante",
            "faixa_etaria",
        ],
        partitioned: true,
    },
    TableSpec {
        name: "simples",
        glob: "*SIMPLES*",
        columns: &[
            "cnpj_basico",
            "opcao_simples",
            "data_opcao_simples",
            "data_exclusao_simples",
            "opcao_mei",
            "data_opcao_mei",
            "data_exclusao_mei",
        ],
        partitioned: true,
    },
    TableSpec {
        name: "cnae",
        glob: "*CNAECSV*",
        columns: &["codigo", "descricao"],
        partitioned: false,
    },
    TableSpec {
        name: "motivo",
        glob: "*MOTICSV*",
        columns: &["codigo", "descricao"],
        partitioned: false,
    },
    TableSpec {
        name: "municipio",
        glob: "*MUNICCSV*",
        columns: &["codigo", "descricao"],
        partitioned: false,
    },
    TableSpec {
        name: "natureza",
        glob: "*NATJUCSV*",
        columns: &["codigo", "descricao"],
        partitioned: false,
    },
    TableSpec {
        name: "pais",
        glob: "*PAISCSV*",
        columns: &["codigo", "descricao"],
        partitioned: false,
    },
    TableSpec {
        name: "qualificacao",
        glob: "*QUALSCSV*",
        columns: &["codigo", "descricao"],
        partitioned: false,
    },
];

/// The CSV glob family, used as the extraction resume heuristic.
pub fn csv_resume_globs() -> Vec<String> {
    TABLES.iter().map(|t| t.glob.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_tables_four_partitioned() {
        assert_eq!(TABLES.len(), 10);
        assert_eq!(TABLES.iter().filter(|t| t.partitioned).count(), 4);
    }

    #[test]
    fn schemas_are_all_text() {
        for table in TABLES {
            let schema = table.schema();
            assert_eq!(schema.fields().len(), table.columns.len());
            assert!(schema
                .fields()
                .iter()
                .all(|f| f.data_type() == &DataType::Utf8 && f.is_nullable()));
        }
    }

    #[test]
    fn partitioned_tables_key_on_the_base() {
        for table in TABLES.iter().filter(|t| t.partitioned) {
            assert_eq!(table.columns[0], "cnpj_basico");
        }
    }
}
