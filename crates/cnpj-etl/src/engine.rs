//! Single-session analytical engine over the parquet dataset.
//!
//! One DataFusion session serves every query shape; a mutex serializes access
//! so each query is a critical section, and callers run their own parsing and
//! hashing outside it. The engine has no JSON struct constructor, so the
//! per-entity document is assembled here from a flat joined row plus a
//! partner aggregation grouped in memory.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::arrow::array::{Array, Int64Array, RecordBatch, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::datasource::MemTable;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::{ParquetReadOptions, SessionConfig, SessionContext};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cnpj_core::cnpj::CnpjParts;
use cnpj_core::config::EngineSettings;

use crate::document::{self, Document, EstablishmentRow, Socio, SocioRow};
use crate::tables::{TableSpec, PARTITION_COLUMN, TABLES};

/// The shared engine session.
pub struct QueryEngine {
    session: Mutex<SessionContext>,
    parquet_dir: PathBuf,
}

impl QueryEngine {
    /// Build a tuned in-memory session. Thread count is the maximum of the
    /// configured values and the CPU count; the memory limit string takes
    /// byte-size suffixes (`5GB`).
    pub fn open(settings: &EngineSettings, parquet_dir: impl Into<PathBuf>) -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let threads = settings
            .threads_pragma
            .max(settings.engine_threads)
            .max(cpus);

        let mut config = SessionConfig::new()
            .with_target_partitions(threads)
            .with_round_robin_repartition(!settings.preserve_insertion_order);
        // Plain Utf8 everywhere keeps row extraction uniform.
        config.options_mut().execution.parquet.schema_force_view_types = false;

        let memory: bytesize::ByteSize = settings
            .memory_limit
            .parse()
            .map_err(|err: String| anyhow::anyhow!("memory limit: {err}"))?;
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(memory.as_u64() as usize, 1.0)
            .build_arc()?;

        let session = SessionContext::new_with_config_rt(config, runtime);
        info!(threads, memory_limit = %settings.memory_limit, "engine session ready");

        Ok(Self {
            session: Mutex::new(session),
            parquet_dir: parquet_dir.into(),
        })
    }

    /// Register the ten tables over the on-disk dataset. A table whose
    /// dataset is missing registers as an empty in-memory table so the LEFT
    /// JOINs still resolve.
    pub async fn register_views(&self) -> Result<()> {
        let session = self.session.lock().await;

        for table in TABLES {
            if table.partitioned {
                let dir = self.parquet_dir.join(table.name);
                let pattern = format!("{}/**/*.parquet", dir.display());
                let has_data = glob::glob(&pattern)
                    .map(|mut paths| paths.next().is_some())
                    .unwrap_or(false);

                if has_data {
                    let options = ParquetReadOptions::default().table_partition_cols(vec![(
                        PARTITION_COLUMN.to_string(),
                        DataType::Utf8,
                    )]);
                    session
                        .register_parquet(table.name, dir.to_string_lossy().as_ref(), options)
                        .await
                        .with_context(|| format!("register {}", table.name))?;
                } else {
                    warn!(table = table.name, "dataset missing, registering empty");
                    register_empty(&session, table)?;
                }
            } else {
                let file = self.parquet_dir.join(format!("{}.parquet", table.name));
                if file.exists() {
                    session
                        .register_parquet(
                            table.name,
                            file.to_string_lossy().as_ref(),
                            ParquetReadOptions::default(),
                        )
                        .await
                        .with_context(|| format!("register {}", table.name))?;
                } else {
                    warn!(table = table.name, "lookup missing, registering empty");
                    register_empty(&session, table)?;
                }
            }
            debug!(table = table.name, "registered");
        }
        Ok(())
    }

    /// All documents of one partition as `(cnpj, json)` pairs.
    pub async fn project_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let session = self.session.lock().await;
        let socios = socio_map(&session, &format!("s.{PARTITION_COLUMN} = '{prefix}'")).await?;

        let sql = establishment_sql(&format!("e.{PARTITION_COLUMN} = '{prefix}'"));
        let mut stream = session.sql(&sql).await?.execute_stream().await?;

        let mut rows = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            for row in 0..batch.num_rows() {
                let doc = row_document(&batch, row, &socios)?;
                rows.push((doc.cnpj.clone(), serde_json::to_string(&doc)?));
            }
        }
        Ok(rows)
    }

    /// Stream one partition into an NDJSON file, one document per line.
    /// Returns the number of lines written.
    pub async fn export_prefix_ndjson(&self, prefix: &str, target: &Path) -> Result<usize> {
        let session = self.session.lock().await;
        let socios = socio_map(&session, &format!("s.{PARTITION_COLUMN} = '{prefix}'")).await?;

        let sql = establishment_sql(&format!("e.{PARTITION_COLUMN} = '{prefix}'"));
        let mut stream = session.sql(&sql).await?.execute_stream().await?;

        let file = std::fs::File::create(target)
            .with_context(|| format!("create {}", target.display()))?;
        let mut writer = std::io::BufWriter::with_capacity(1 << 20, file);

        let mut count = 0usize;
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            for row in 0..batch.num_rows() {
                let doc = row_document(&batch, row, &socios)?;
                serde_json::to_writer(&mut writer, &doc)?;
                writer.write_all(b"\n")?;
                count += 1;
            }
        }
        writer.flush()?;
        Ok(count)
    }

    /// The document for one full identifier, if present. The parts come from
    /// the identifier codec, which admits only `[A-Z0-9]`.
    pub async fn project_one(&self, parts: &CnpjParts) -> Result<Option<String>> {
        let session = self.session.lock().await;
        let socios = socio_map(&session, &format!("s.cnpj_basico = '{}'", parts.basico)).await?;

        let filter = format!(
            "e.cnpj_basico = '{}' AND e.cnpj_ordem = '{}' AND e.cnpj_dv = '{}'",
            parts.basico, parts.ordem, parts.dv
        );
        let batches = session.sql(&establishment_sql(&filter)).await?.collect().await?;

        for batch in &batches {
            if batch.num_rows() > 0 {
                let doc = row_document(batch, 0, &socios)?;
                return Ok(Some(serde_json::to_string(&doc)?));
            }
        }
        Ok(None)
    }

    pub async fn count_establishments(&self) -> Result<i64> {
        let session = self.session.lock().await;
        let batches = session
            .sql("SELECT COUNT(*) FROM estabelecimento")
            .await?
            .collect()
            .await?;
        let batch = batches.first().context("empty count result")?;
        let counts = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("count column type")?;
        Ok(counts.value(0))
    }

    /// Sample identifiers for the integrity check: one with a tax-regime row,
    /// one with a partner row, the rest random and distinct.
    pub async fn sample_cnpjs(&self, total: usize) -> Result<Vec<String>> {
        let session = self.session.lock().await;
        let mut sample: Vec<String> = Vec::new();

        let targeted = [
            "SELECT e.cnpj_basico || e.cnpj_ordem || e.cnpj_dv AS cnpj \
             FROM estabelecimento e \
             INNER JOIN simples s ON e.cnpj_basico = s.cnpj_basico \
             ORDER BY random() LIMIT 1",
            "SELECT e.cnpj_basico || e.cnpj_ordem || e.cnpj_dv AS cnpj \
             FROM estabelecimento e \
             INNER JOIN socio so ON e.cnpj_basico = so.cnpj_basico \
             ORDER BY random() LIMIT 1",
        ];
        for sql in targeted {
            match collect_cnpjs(&session, sql).await {
                Ok(rows) => {
                    if let Some(cnpj) = rows.into_iter().next() {
                        push_unique(&mut sample, cnpj);
                    }
                }
                Err(err) => debug!(%err, "targeted sample query failed"),
            }
        }

        while sample.len() < total {
            let limit = ((total - sample.len()) * 2).max(8);
            let sql = format!(
                "SELECT cnpj FROM ( \
                   SELECT DISTINCT e.cnpj_basico || e.cnpj_ordem || e.cnpj_dv AS cnpj \
                   FROM estabelecimento e \
                 ) t ORDER BY random() LIMIT {limit}"
            );
            let rows = collect_cnpjs(&session, &sql).await?;
            if rows.is_empty() {
                break;
            }
            let before = sample.len();
            for cnpj in rows {
                push_unique(&mut sample, cnpj);
                if sample.len() >= total {
                    break;
                }
            }
            if sample.len() == before {
                // The corpus is smaller than the requested sample.
                break;
            }
        }

        sample.truncate(total);
        Ok(sample)
    }
}

fn register_empty(session: &SessionContext, table: &TableSpec) -> Result<()> {
    let mut fields: Vec<Field> = table
        .columns
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect();
    if table.partitioned {
        fields.push(Field::new(PARTITION_COLUMN, DataType::Utf8, true));
    }
    let schema = Arc::new(Schema::new(fields));
    let provider = MemTable::try_new(schema, vec![vec![]])?;
    session.register_table(table.name, Arc::new(provider))?;
    Ok(())
}

/// The flat join plan. Every join is LEFT so a bare establishment still
/// projects; the filter decides the shape (one prefix or one identifier).
fn establishment_sql(filter: &str) -> String {
    format!(
        "SELECT \
           e.cnpj_basico, e.cnpj_ordem, e.cnpj_dv, \
           e.identificador_matriz_filial, e.nome_fantasia, e.situacao_cadastral, \
           e.data_situacao_cadastral, e.data_inicio_atividade, \
           e.cnae_principal, e.cnaes_secundarios, \
           e.tipo_logradouro, e.logradouro, e.numero, e.complemento, e.bairro, \
           e.cep, e.uf, \
           e.ddd1, e.telefone1, e.ddd2, e.telefone2, e.ddd_fax, e.fax, \
           e.correio_eletronico, \
           emp.razao_social, emp.capital_social, emp.porte_empresa, \
           nat.descricao AS natureza_juridica, \
           mun.descricao AS municipio, \
           s.opcao_simples, s.data_opcao_simples, s.opcao_mei, s.data_opcao_mei \
         FROM estabelecimento e \
         LEFT JOIN empresa emp ON e.cnpj_basico = emp.cnpj_basico \
         LEFT JOIN simples s ON e.cnpj_basico = s.cnpj_basico \
         LEFT JOIN natureza nat ON emp.natureza_juridica = nat.codigo \
         LEFT JOIN municipio mun ON e.codigo_municipio = mun.codigo \
         WHERE {filter}"
    )
}

/// Partner rows grouped by base, qualification decoded through the lookup.
async fn socio_map(
    session: &SessionContext,
    filter: &str,
) -> Result<HashMap<String, Vec<Socio>>> {
    let sql = format!(
        "SELECT s.cnpj_basico, s.nome_socio, s.cnpj_cpf_socio, \
           qs.descricao AS qualificacao_socio, \
           s.data_entrada_sociedade, s.identificador_socio, s.faixa_etaria \
         FROM socio s \
         LEFT JOIN qualificacao qs ON s.qualificacao_socio = qs.codigo \
         WHERE {filter}"
    );
    let mut stream = session.sql(&sql).await?.execute_stream().await?;

    let mut map: HashMap<String, Vec<Socio>> = HashMap::new();
    while let Some(batch) = stream.next().await {
        let batch = batch?;
        for row in 0..batch.num_rows() {
            let Some(basico) = opt_string(&batch, "cnpj_basico", row)? else {
                continue;
            };
            let socio = document::build_socio(&SocioRow {
                nome_socio: opt_string(&batch, "nome_socio", row)?,
                cnpj_cpf_socio: opt_string(&batch, "cnpj_cpf_socio", row)?,
                qualificacao_socio: opt_string(&batch, "qualificacao_socio", row)?,
                data_entrada_sociedade: opt_string(&batch, "data_entrada_sociedade", row)?,
                identificador_socio: opt_string(&batch, "identificador_socio", row)?,
                faixa_etaria: opt_string(&batch, "faixa_etaria", row)?,
            });
            map.entry(basico).or_default().push(socio);
        }
    }
    Ok(map)
}

fn row_document(
    batch: &RecordBatch,
    row: usize,
    socios: &HashMap<String, Vec<Socio>>,
) -> Result<Document> {
    let raw = EstablishmentRow {
        cnpj_basico: opt_string(batch, "cnpj_basico", row)?,
        cnpj_ordem: opt_string(batch, "cnpj_ordem", row)?,
        cnpj_dv: opt_string(batch, "cnpj_dv", row)?,
        identificador_matriz_filial: opt_string(batch, "identificador_matriz_filial", row)?,
        nome_fantasia: opt_string(batch, "nome_fantasia", row)?,
        situacao_cadastral: opt_string(batch, "situacao_cadastral", row)?,
        data_situacao_cadastral: opt_string(batch, "data_situacao_cadastral", row)?,
        data_inicio_atividade: opt_string(batch, "data_inicio_atividade", row)?,
        cnae_principal: opt_string(batch, "cnae_principal", row)?,
        cnaes_secundarios: opt_string(batch, "cnaes_secundarios", row)?,
        tipo_logradouro: opt_string(batch, "tipo_logradouro", row)?,
        logradouro: opt_string(batch, "logradouro", row)?,
        numero: opt_string(batch, "numero", row)?,
        complemento: opt_string(batch, "complemento", row)?,
        bairro: opt_string(batch, "bairro", row)?,
        cep: opt_string(batch, "cep", row)?,
        uf: opt_string(batch, "uf", row)?,
        ddd1: opt_string(batch, "ddd1", row)?,
        telefone1: opt_string(batch, "telefone1", row)?,
        ddd2: opt_string(batch, "ddd2", row)?,
        telefone2: opt_string(batch, "telefone2", row)?,
        ddd_fax: opt_string(batch, "ddd_fax", row)?,
        fax: opt_string(batch, "fax", row)?,
        correio_eletronico: opt_string(batch, "correio_eletronico", row)?,
        razao_social: opt_string(batch, "razao_social", row)?,
        capital_social: opt_string(batch, "capital_social", row)?,
        porte_empresa: opt_string(batch, "porte_empresa", row)?,
        natureza_juridica: opt_string(batch, "natureza_juridica", row)?,
        municipio: opt_string(batch, "municipio", row)?,
        opcao_simples: opt_string(batch, "opcao_simples", row)?,
        data_opcao_simples: opt_string(batch, "data_opcao_simples", row)?,
        opcao_mei: opt_string(batch, "opcao_mei", row)?,
        data_opcao_mei: opt_string(batch, "data_opcao_mei", row)?,
    };

    let qsa = raw
        .cnpj_basico
        .as_ref()
        .and_then(|basico| socios.get(basico))
        .cloned()
        .unwrap_or_default();

    Ok(document::build_document(&raw, qsa))
}

/// Text cell access. Null and the empty string both read as absent, matching
/// how the loader transports empty CSV fields.
fn opt_string(batch: &RecordBatch, column: &str, row: usize) -> Result<Option<String>> {
    let array = batch
        .column_by_name(column)
        .with_context(|| format!("column {column} missing"))?;
    let strings = array
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {column} is not text"))?;
    if strings.is_null(row) {
        return Ok(None);
    }
    let value = strings.value(row);
    Ok((!value.is_empty()).then(|| value.to_string()))
}

async fn collect_cnpjs(session: &SessionContext, sql: &str) -> Result<Vec<String>> {
    let batches = session.sql(sql).await?.collect().await?;
    let mut out = Vec::new();
    for batch in &batches {
        for row in 0..batch.num_rows() {
            if let Some(cnpj) = opt_string(batch, "cnpj", row)? {
                out.push(cnpj);
            }
        }
    }
    Ok(out)
}

fn push_unique(sample: &mut Vec<String>, cnpj: String) {
    if !sample.contains(&cnpj) {
        sample.push(cnpj);
    }
}
