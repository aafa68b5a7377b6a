//! CSV family → partitioned columnar dataset.
//!
//! Every table is transported as text columns. The four large tables are
//! routed row-by-row into hive-style `cnpj_prefix=NN` directories; lookups
//! become single files. Conversion is resumable: a table whose target already
//! holds parquet is skipped. Rows that fail to parse are counted and skipped,
//! never fatal.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use datafusion::arrow::array::{Array, ArrayRef, RecordBatch, StringArray, UInt32Array};
use datafusion::arrow::compute::take;
use datafusion::arrow::csv::reader::ReaderBuilder;
use datafusion::parquet::arrow::arrow_writer::ArrowWriter;
use datafusion::parquet::basic::{Compression, ZstdLevel};
use datafusion::parquet::file::properties::WriterProperties;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tables::{TableSpec, PARTITION_COLUMN, TABLES};
use crate::transcode::Windows1252Reader;

const BATCH_ROWS: usize = 65536;

/// Converts the extracted CSV tree into the parquet dataset.
pub struct CsvLoader {
    data_dir: PathBuf,
    parquet_dir: PathBuf,
}

impl CsvLoader {
    pub fn new(data_dir: impl Into<PathBuf>, parquet_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            parquet_dir: parquet_dir.into(),
        }
    }

    /// Convert every table with matching CSVs. Tables whose parquet target is
    /// already present are skipped.
    pub async fn convert_all(&self, cancel: &CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.parquet_dir)?;

        for table in TABLES {
            if cancel.is_cancelled() {
                anyhow::bail!("conversion cancelled");
            }

            if self.target_exists(table) {
                info!(table = table.name, "parquet already present, skipping");
                continue;
            }

            let files = self.find_csvs(table)?;
            if files.is_empty() {
                warn!(table = table.name, pattern = table.glob, "no CSV files found");
                continue;
            }

            info!(table = table.name, files = files.len(), "converting");
            let parquet_dir = self.parquet_dir.clone();
            tokio::task::spawn_blocking(move || convert_table(table, files, parquet_dir))
                .await
                .context("conversion task")??;
        }
        Ok(())
    }

    fn find_csvs(&self, table: &TableSpec) -> Result<Vec<PathBuf>> {
        let pattern = format!("{}/**/{}", self.data_dir.display(), table.glob);
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .context("csv glob")?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    fn target_exists(&self, table: &TableSpec) -> bool {
        if table.partitioned {
            let pattern = format!(
                "{}/{}/**/*.parquet",
                self.parquet_dir.display(),
                table.name
            );
            glob::glob(&pattern)
                .map(|mut paths| paths.next().is_some())
                .unwrap_or(false)
        } else {
            let target = self.parquet_dir.join(format!("{}.parquet", table.name));
            target
                .metadata()
                .map(|meta| meta.len() > 0)
                .unwrap_or(false)
        }
    }
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

fn convert_table(table: &'static TableSpec, files: Vec<PathBuf>, parquet_dir: PathBuf) -> Result<()> {
    if table.partitioned {
        convert_partitioned(table, &files, &parquet_dir)
    } else {
        convert_single(table, &files, &parquet_dir)
    }
}

fn convert_single(table: &TableSpec, files: &[PathBuf], parquet_dir: &Path) -> Result<()> {
    let target = parquet_dir.join(format!("{}.parquet", table.name));
    let schema = table.schema();
    let file = File::create(&target).with_context(|| format!("create {}", target.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(writer_properties()))?;

    let mut rows = 0usize;
    for path in files {
        for batch in read_csv_batches(table, path)? {
            rows += batch.num_rows();
            writer.write(&batch)?;
        }
    }
    writer.close()?;

    info!(table = table.name, rows, "wrote single-file parquet");
    Ok(())
}

fn convert_partitioned(table: &TableSpec, files: &[PathBuf], parquet_dir: &Path) -> Result<()> {
    let schema = table.schema();
    let mut writers: HashMap<String, ArrowWriter<File>> = HashMap::new();
    let mut rows = 0usize;
    let mut skipped = 0usize;

    for path in files {
        for batch in read_csv_batches(table, path)? {
            let groups = group_by_prefix(&batch, &mut skipped)?;
            for (prefix, indices) in groups {
                let indices = UInt32Array::from(indices);
                let columns: Vec<ArrayRef> = batch
                    .columns()
                    .iter()
                    .map(|col| take(col.as_ref(), &indices, None))
                    .collect::<std::result::Result<_, _>>()?;
                let part = RecordBatch::try_new(schema.clone(), columns)?;
                rows += part.num_rows();

                let writer = match writers.entry(prefix) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let dir = parquet_dir
                            .join(table.name)
                            .join(format!("{PARTITION_COLUMN}={}", e.key()));
                        std::fs::create_dir_all(&dir)?;
                        let file = File::create(dir.join("data_0.parquet"))?;
                        e.insert(ArrowWriter::try_new(
                            file,
                            schema.clone(),
                            Some(writer_properties()),
                        )?)
                    }
                };
                writer.write(&part)?;
            }
        }
    }

    let partitions = writers.len();
    for (_, writer) in writers {
        writer.close()?;
    }

    if skipped > 0 {
        debug!(table = table.name, skipped, "rows without a usable prefix");
    }
    info!(table = table.name, rows, partitions, "wrote partitioned parquet");
    Ok(())
}

/// Per-prefix row indices for one batch. Rows whose base cannot yield a
/// two-character prefix are counted and dropped.
fn group_by_prefix(
    batch: &RecordBatch,
    skipped: &mut usize,
) -> Result<HashMap<String, Vec<u32>>> {
    let base = batch
        .column(0)
        .as_any()
        .downcast_ref::<StringArray>()
        .context("base column is not text")?;

    let mut groups: HashMap<String, Vec<u32>> = HashMap::new();
    for row in 0..batch.num_rows() {
        if base.is_null(row) {
            *skipped += 1;
            continue;
        }
        match prefix_of(base.value(row)) {
            Some(prefix) => groups.entry(prefix).or_default().push(row as u32),
            None => *skipped += 1,
        }
    }
    Ok(groups)
}

fn prefix_of(value: &str) -> Option<String> {
    let mut chars = value.chars();
    let a = chars.next()?;
    let b = chars.next()?;
    Some([a, b].into_iter().collect())
}

/// Read one CP1252 CSV into text batches. A read error abandons the rest of
/// the file; rows already parsed are kept.
fn read_csv_batches(table: &TableSpec, path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let decoded = Windows1252Reader::new(file);

    let mut reader = ReaderBuilder::new(table.schema())
        .with_header(false)
        .with_delimiter(b';')
        .with_quote(b'"')
        .with_escape(b'"')
        .with_batch_size(BATCH_ROWS)
        .build(decoded)?;

    let mut batches = Vec::new();
    loop {
        match reader.next() {
            Some(Ok(batch)) => batches.push(batch),
            Some(Err(err)) => {
                warn!(file = %path.display(), %err, "csv read error, abandoning file");
                break;
            }
            None => break,
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn read_parquet_rows(path: &Path) -> Vec<RecordBatch> {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[tokio::test]
    async fn converts_lookup_and_partitioned_tables() {
        let data = tempfile::tempdir().unwrap();
        let parquet = tempfile::tempdir().unwrap();

        // CP1252 bytes: 0xC3 is "Ã".
        std::fs::write(
            data.path().join("F.K03200$Z.D40511.MUNICCSV"),
            b"\"7107\";\"S\xC3O PAULO\"\n\"9701\";\"BRASILIA\"\n",
        )
        .unwrap();
        std::fs::write(
            data.path().join("F.K03200$W.SIMPLES.CSV.D40511"),
            b"\"12345678\";\"S\";\"20200101\";\"\";\"N\";\"\";\"\"\n\
              \"98765432\";\"N\";\"\";\"\";\"N\";\"\";\"\"\n",
        )
        .unwrap();

        let loader = CsvLoader::new(data.path(), parquet.path());
        loader
            .convert_all(&CancellationToken::new())
            .await
            .unwrap();

        let municipio = parquet.path().join("municipio.parquet");
        let batches = read_parquet_rows(&municipio);
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        let names = batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "SÃO PAULO");

        for prefix in ["12", "98"] {
            let part = parquet
                .path()
                .join("simples")
                .join(format!("cnpj_prefix={prefix}"))
                .join("data_0.parquet");
            let batches = read_parquet_rows(&part);
            let total: usize = batches.iter().map(|b| b.num_rows()).sum();
            assert_eq!(total, 1, "one row in partition {prefix}");
        }
    }

    #[tokio::test]
    async fn existing_parquet_is_not_rewritten() {
        let data = tempfile::tempdir().unwrap();
        let parquet = tempfile::tempdir().unwrap();
        std::fs::write(
            data.path().join("K.MUNICCSV"),
            b"\"7107\";\"CAMPINAS\"\n",
        )
        .unwrap();

        let loader = CsvLoader::new(data.path(), parquet.path());
        loader.convert_all(&CancellationToken::new()).await.unwrap();

        let target = parquet.path().join("municipio.parquet");
        let before = target.metadata().unwrap().modified().unwrap();
        loader.convert_all(&CancellationToken::new()).await.unwrap();
        let after = target.metadata().unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn prefix_routing_needs_two_characters() {
        assert_eq!(prefix_of("12345678").as_deref(), Some("12"));
        assert_eq!(prefix_of("AB123").as_deref(), Some("AB"));
        assert_eq!(prefix_of("1"), None);
        assert_eq!(prefix_of(""), None);
    }
}
