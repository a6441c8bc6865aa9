// src/pipeline/mod.rs
//
// Drives a run: resolve inputs, configure the store, stream every file
// block by block into the loader, then index and analyze.

pub mod report;
pub mod state;

pub use report::{BlockProgress, FileReport, RunReport};
pub use state::PipelineState;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Instant,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{EtlConfig, RerunPolicy};
use crate::error::{EtlError, Result};
use crate::history::{file_key, State};
use crate::load::{LoadOptions, Loader};
use crate::process::{self, file_label, with_source, Block, BlockReader, TransformStats};
use crate::schema::TableMapping;

/// One resolved input file and the mapping it loads through.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub mapping: usize,
    pub path: PathBuf,
}

pub struct Pipeline {
    config: EtlConfig,
    mappings: Vec<TableMapping>,
    state: PipelineState,
}

impl Pipeline {
    /// Validate `config`. Nothing is opened yet.
    pub fn new(config: EtlConfig) -> Result<Self> {
        let mappings = config.validate()?;
        Ok(Self {
            config,
            mappings,
            state: PipelineState::Pending,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn mappings(&self) -> &[TableMapping] {
        &self.mappings
    }

    pub fn run(&mut self) -> Result<RunReport> {
        self.run_observed(|_, _| Ok(()))
    }

    /// Like [`Pipeline::run`], calling `observer` after each committed block.
    /// An error from the observer aborts the run.
    #[instrument(level = "info", skip_all, fields(db = %self.config.database.display()))]
    pub fn run_observed<F>(&mut self, mut observer: F) -> Result<RunReport>
    where
        F: FnMut(&Loader, &BlockProgress<'_>) -> Result<()>,
    {
        match self.execute(&mut observer) {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(state = %self.state, error = %e, "run failed");
                if !self.state.is_terminal() {
                    self.state = PipelineState::Failed;
                }
                Err(e)
            }
        }
    }

    fn execute<F>(&mut self, observer: &mut F) -> Result<RunReport>
    where
        F: FnMut(&Loader, &BlockProgress<'_>) -> Result<()>,
    {
        if self.state != PipelineState::Pending {
            return Err(EtlError::State(format!(
                "a pipeline runs once; this one is {}",
                self.state
            )));
        }
        let started = Instant::now();
        let inputs = self.resolve_inputs()?;
        info!(files = inputs.len(), tables = self.mappings.len(), "inputs resolved");

        let mut loader = Loader::open(&self.config.database, LoadOptions::from(&self.config))?;
        loader.configure()?;
        self.state.advance(PipelineState::PragmaConfigured)?;

        let mut report = RunReport::default();
        let mut prepared: HashSet<usize> = HashSet::new();
        for input in &inputs {
            let mapping = &self.mappings[input.mapping];
            if prepared.insert(input.mapping) {
                loader.prepare_table(mapping)?;
            }
            let file = load_file(
                &mut loader,
                mapping,
                &input.path,
                &self.config,
                &mut self.state,
                observer,
            )?;
            report.files.push(file);
        }

        self.state.advance(PipelineState::Indexing)?;
        report.indexes_created = loader.finalize(&self.mappings)?;
        self.state.advance(PipelineState::Done)?;

        report.elapsed_ms = started.elapsed().as_millis();
        let totals = report.transform();
        info!(
            files = report.files.len(),
            skipped = report.skipped(),
            records = totals.records,
            dropped = totals.dropped,
            inserted = report.inserted(),
            elapsed_ms = report.elapsed_ms,
            "run complete"
        );
        Ok(report)
    }

    /// Run only the transformer over every input and report what would be
    /// kept. The database is never opened.
    pub fn check(&self) -> Result<Vec<FileReport>> {
        let mut reports = Vec::new();
        for input in self.resolve_inputs()? {
            let mapping = &self.mappings[input.mapping];
            let started = Instant::now();
            let mut file = FileReport::new(&mapping.table, &file_label(&input.path));
            file.transform = process::scan_file(
                &input.path,
                mapping,
                self.config.validation,
                self.config.block_size,
            )?;
            file.elapsed_ms = started.elapsed().as_millis();
            reports.push(file);
        }
        Ok(reports)
    }

    /// Expand every input pattern; matches of one pattern load in sorted
    /// order, patterns in configuration order. A pattern with no match is a
    /// source error.
    pub fn resolve_inputs(&self) -> Result<Vec<ResolvedInput>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for input in &self.config.inputs {
            let mapping = self
                .mappings
                .iter()
                .position(|m| m.table == input.table)
                .ok_or_else(|| EtlError::config(format!("no mapping for table `{}`", input.table)))?;

            let entries = glob::glob(&input.path)
                .map_err(|e| EtlError::config(format!("bad input pattern `{}`: {e}", input.path)))?;
            let mut paths = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| EtlError::source(e.path(), e.error().to_string()))?;
                if path.is_file() {
                    paths.push(path);
                }
            }
            if paths.is_empty() {
                return Err(EtlError::source(&input.path, "no file matches this input"));
            }
            paths.sort();
            for path in paths {
                if seen.insert(path.clone()) {
                    resolved.push(ResolvedInput { mapping, path });
                } else {
                    warn!(path = %path.display(), "input listed twice, loading once");
                }
            }
        }
        Ok(resolved)
    }
}

#[instrument(level = "info", skip_all, fields(table = %mapping.table, file = %file_label(path)))]
fn load_file<F>(
    loader: &mut Loader,
    mapping: &TableMapping,
    path: &Path,
    config: &EtlConfig,
    state: &mut PipelineState,
    observer: &mut F,
) -> Result<FileReport>
where
    F: FnMut(&Loader, &BlockProgress<'_>) -> Result<()>,
{
    let label = file_label(path);
    let key = file_key(path);
    let mut report = FileReport::new(&mapping.table, &label);

    if config.rerun == RerunPolicy::Upsert && loader.history()?.is_loaded(&mapping.table, &key)? {
        info!("already loaded, skipping");
        report.skipped = true;
        return Ok(report);
    }

    let started = Instant::now();
    loader
        .history()?
        .record(&mapping.table, &key, State::Started, 0, 0)?;

    let mut consume = |block: Block| -> Result<()> {
        state.advance(PipelineState::Loading)?;
        let stats = loader.load_block(mapping, &block)?;
        report.load.add(stats);
        report.blocks += 1;
        debug!(
            block = block.index,
            rows = block.len(),
            inserted = stats.inserted,
            ignored = stats.ignored,
            "block committed"
        );
        observer(
            loader,
            &BlockProgress {
                table: &mapping.table,
                file: &label,
                block: block.index,
                rows: block.len(),
                inserted_so_far: report.load.inserted,
            },
        )
    };

    let transform = if config.prefetch {
        read_prefetched(path, mapping, config, &label, &mut consume)?
    } else {
        read_sequential(path, mapping, config, &label, &mut consume)?
    };
    report.transform = transform;
    report.elapsed_ms = started.elapsed().as_millis();

    loader.history()?.record(
        &mapping.table,
        &key,
        State::Loaded,
        transform.records,
        report.load.inserted,
    )?;

    info!(
        records = transform.records,
        transformed = transform.transformed,
        dropped = transform.dropped,
        nulled = transform.nulled,
        inserted = report.load.inserted,
        ignored = report.load.ignored,
        elapsed_ms = report.elapsed_ms,
        "file loaded"
    );
    Ok(report)
}

/// Decode and insert on the same thread.
fn read_sequential(
    path: &Path,
    mapping: &TableMapping,
    config: &EtlConfig,
    label: &str,
    consume: &mut dyn FnMut(Block) -> Result<()>,
) -> Result<TransformStats> {
    with_source(path, mapping.member_suffix.as_deref(), |reader| {
        let mut blocks =
            BlockReader::new(reader, mapping, config.validation, config.block_size, label);
        while let Some(block) = blocks.next() {
            consume(block?)?;
        }
        Ok(blocks.stats())
    })
}

/// Decode the next block on a producer thread while the current one is
/// inserted. At most two blocks exist at once: the one being inserted and
/// the one decoded behind it.
fn read_prefetched(
    path: &Path,
    mapping: &TableMapping,
    config: &EtlConfig,
    label: &str,
    consume: &mut dyn FnMut(Block) -> Result<()>,
) -> Result<TransformStats> {
    let (policy, block_size) = (config.validation, config.block_size);
    hand_off(
        move |send| {
            with_source(path, mapping.member_suffix.as_deref(), |reader| {
                let mut blocks = BlockReader::new(reader, mapping, policy, block_size, label);
                while let Some(block) = blocks.next() {
                    if !send(block?) {
                        // Consumer stopped; its error wins.
                        break;
                    }
                }
                Ok(blocks.stats())
            })
        },
        consume,
    )
}

/// Run `produce` on a scoped thread and feed what it sends to `consume`.
/// The channel is a rendezvous: a send returns only once the consumer has
/// taken the item, so the producer is never more than one item ahead.
/// `send` returns false after the consumer has failed.
fn hand_off<T, S, P>(produce: P, consume: &mut dyn FnMut(T) -> Result<()>) -> Result<S>
where
    T: Send,
    S: Send,
    P: FnOnce(&mut dyn FnMut(T) -> bool) -> Result<S> + Send,
{
    let (tx, rx) = mpsc::sync_channel::<T>(0);

    thread::scope(|scope| {
        let producer = scope.spawn(move || {
            let mut send = |item: T| tx.send(item).is_ok();
            produce(&mut send)
        });

        let mut consumed = Ok(());
        for item in rx.iter() {
            if let Err(e) = consume(item) {
                consumed = Err(e);
                break;
            }
        }
        drop(rx);

        let produced = producer
            .join()
            .map_err(|_| EtlError::State("block producer thread panicked".into()))?;
        consumed?;
        produced
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputSpec;
    use crate::history::History;
    use crate::schema::{ColumnSpec, ColumnType};
    use crate::config::TableConfig;
    use anyhow::Result;
    use flate2::{write::GzEncoder, Compression};
    use std::{fs::File, io::Write};
    use tempfile::{tempdir, TempDir};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    fn gz(dir: &TempDir, name: &str, text: &str) -> Result<PathBuf> {
        let path = dir.path().join(name);
        let mut enc = GzEncoder::new(File::create(&path)?, Compression::default());
        enc.write_all(text.as_bytes())?;
        enc.finish()?;
        Ok(path)
    }

    fn amostra() -> TableConfig {
        TableConfig {
            layout: Some(
                ["cnpj_basico", "id_municipio", "id_cnae", "situacao_cadastral"]
                    .map(String::from)
                    .to_vec(),
            ),
            columns: Some(vec![
                ColumnSpec::new("cnpj_basico", ColumnType::Integer).required(),
                ColumnSpec::new("id_municipio", ColumnType::Integer).required(),
                ColumnSpec::new("id_cnae", ColumnType::Integer),
                ColumnSpec::new("situacao_cadastral", ColumnType::Text),
            ]),
            key: Some(vec!["cnpj_basico".into()]),
            indexes: Some(vec!["id_municipio".into(), "id_cnae".into()]),
            ..TableConfig::default()
        }
    }

    fn config(dir: &TempDir, input: &Path) -> EtlConfig {
        let mut c = EtlConfig::default();
        c.database = dir.path().join("cnpj.db");
        c.tables.insert("amostra".into(), amostra());
        c.inputs
            .push(InputSpec::new("amostra", &input.display().to_string()));
        c
    }

    fn synthetic(n: usize) -> String {
        (1..=n)
            .map(|i| format!("{i};{};{};ATIVA\n", 7000 + i % 5, 4100 + i))
            .collect()
    }

    fn rows(db: &Path) -> Result<Vec<String>> {
        let conn = rusqlite::Connection::open(db)?;
        let mut stmt = conn.prepare(
            "SELECT cnpj_basico, id_municipio, id_cnae, situacao_cadastral FROM amostra ORDER BY cnpj_basico",
        )?;
        let out = stmt
            .query_map([], |r| {
                Ok(format!(
                    "{},{},{},{}",
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, Option<i64>>(2)?.map(|v| v.to_string()).unwrap_or_default(),
                    r.get::<_, Option<String>>(3)?.unwrap_or_default()
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    #[test]
    fn three_row_sample_loads_two_rows() -> Result<()> {
        init_tracing();
        let dir = tempdir()?;
        let input = gz(
            &dir,
            "sample.csv.gz",
            "cnpj_basico;id_municipio;id_cnae;situacao_cadastral\n1;10;20;ATIVA\n2;11;21;ATIVA\n3;;22;BAIXADA\n",
        )?;
        let mut c = config(&dir, &input);
        c.tables.get_mut("amostra").unwrap().has_headers = Some(true);
        c.block_size = 2;
        c.batch_size = 2;

        let mut pipeline = Pipeline::new(c.clone())?;
        let report = pipeline.run()?;
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(report.inserted(), 2);
        assert_eq!(report.transform().dropped, 1);
        assert_eq!(rows(&c.database)?, ["1,10,20,ATIVA", "2,11,21,ATIVA"]);
        Ok(())
    }

    #[test]
    fn row_count_is_invariant_across_block_and_batch_sizes() -> Result<()> {
        init_tracing();
        let dir = tempdir()?;
        let input = gz(&dir, "synthetic.csv.gz", &synthetic(137))?;
        for block_size in [1, 10, 50, 137, 1000] {
            for batch_size in [1, 7, 5000] {
                let mut c = config(&dir, &input);
                c.block_size = block_size;
                c.batch_size = batch_size;
                let report = Pipeline::new(c.clone())?.run()?;
                assert_eq!(report.inserted(), 137, "block {block_size} batch {batch_size}");
                assert_eq!(rows(&c.database)?.len(), 137);
            }
        }
        Ok(())
    }

    #[test]
    fn rerun_is_idempotent_under_both_policies() -> Result<()> {
        init_tracing();
        for rerun in [RerunPolicy::Truncate, RerunPolicy::Upsert] {
            let dir = tempdir()?;
            let input = gz(&dir, "synthetic.csv.gz", &synthetic(40))?;
            let mut c = config(&dir, &input);
            c.rerun = rerun;
            c.block_size = 16;

            Pipeline::new(c.clone())?.run()?;
            let first = rows(&c.database)?;
            let second_report = Pipeline::new(c.clone())?.run()?;
            assert_eq!(rows(&c.database)?, first, "{rerun:?}");
            assert_eq!(first.len(), 40);
            if rerun == RerunPolicy::Upsert {
                assert_eq!(second_report.skipped(), 1);
            }
        }
        Ok(())
    }

    #[test]
    fn upsert_reload_of_a_partial_file_never_duplicates() -> Result<()> {
        let dir = tempdir()?;
        let input = gz(&dir, "synthetic.csv.gz", &synthetic(30))?;
        let mut c = config(&dir, &input);
        c.rerun = RerunPolicy::Upsert;
        Pipeline::new(c.clone())?.run()?;

        // Pretend the previous run died mid-file.
        {
            let conn = rusqlite::Connection::open(&c.database)?;
            History::open(&conn)?.record("amostra", &file_key(&input), State::Started, 0, 0)?;
        }
        let report = Pipeline::new(c.clone())?.run()?;
        assert_eq!(report.skipped(), 0);
        assert_eq!(report.files[0].load.ignored, 30);
        assert_eq!(rows(&c.database)?.len(), 30);
        Ok(())
    }

    #[test]
    fn indexes_exist_only_after_the_last_block() -> Result<()> {
        init_tracing();
        let dir = tempdir()?;
        let input = gz(&dir, "synthetic.csv.gz", &synthetic(25))?;
        let mut c = config(&dir, &input);
        c.block_size = 10;

        // A previous run leaves its indexes behind.
        Pipeline::new(c.clone())?.run()?;

        let mut seen_blocks = 0;
        let report = Pipeline::new(c.clone())?.run_observed(|loader, progress| {
            seen_blocks += 1;
            assert!(loader.indexes_of(progress.table)?.is_empty());
            Ok(())
        })?;
        assert_eq!(seen_blocks, 3);
        assert_eq!(report.indexes_created, 2);

        let conn = rusqlite::Connection::open(&c.database)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_amostra_%'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(n, 2);
        let stats: i64 = conn.query_row("SELECT COUNT(*) FROM sqlite_stat1", [], |r| r.get(0))?;
        assert!(stats > 0);
        Ok(())
    }

    #[test]
    fn prefetch_and_sequential_agree() -> Result<()> {
        let dir = tempdir()?;
        let input = gz(&dir, "synthetic.csv.gz", &synthetic(137))?;
        let mut results = Vec::new();
        for prefetch in [true, false] {
            let mut c = config(&dir, &input);
            c.prefetch = prefetch;
            c.block_size = 10;
            let report = Pipeline::new(c.clone())?.run()?;
            results.push((report.files[0].blocks, report.files[0].transform, rows(&c.database)?));
        }
        assert_eq!(results[0], results[1]);
        Ok(())
    }

    #[test]
    fn producer_stays_at_most_one_block_ahead() -> Result<()> {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let produced = AtomicUsize::new(0);
        let mut seen = Vec::new();
        let sent = hand_off(
            |send| {
                for i in 0..20usize {
                    produced.fetch_add(1, Ordering::SeqCst);
                    if !send(i) {
                        break;
                    }
                }
                Ok(produced.load(Ordering::SeqCst))
            },
            &mut |i: usize| -> crate::error::Result<()> {
                // Give the producer time to run ahead as far as it can.
                thread::sleep(Duration::from_millis(5));
                // Item `i` is held here; only item `i + 1` may exist besides it.
                assert!(produced.load(Ordering::SeqCst) <= i + 2);
                seen.push(i);
                Ok(())
            },
        )?;
        assert_eq!(sent, 20);
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn consumer_error_stops_the_producer() -> Result<()> {
        let mut refused = false;
        let err = hand_off(
            |send| {
                for i in 0..100usize {
                    if !send(i) {
                        refused = true;
                        break;
                    }
                }
                Ok(())
            },
            &mut |i: usize| -> crate::error::Result<()> {
                if i == 3 {
                    return Err(EtlError::State("stop".into()));
                }
                Ok(())
            },
        )
        .unwrap_err();
        assert!(matches!(err, EtlError::State(_)));
        assert!(refused);
        Ok(())
    }

    #[test]
    fn fatal_row_error_keeps_committed_blocks_and_fails() -> Result<()> {
        let dir = tempdir()?;
        let mut text = synthetic(20);
        text.push_str("X9;1;1;ATIVA\n");
        let input = gz(&dir, "bad.csv.gz", &text)?;
        for prefetch in [true, false] {
            let mut c = config(&dir, &input);
            c.prefetch = prefetch;
            c.block_size = 10;
            let mut pipeline = Pipeline::new(c.clone())?;
            let err = pipeline.run().unwrap_err();
            assert!(matches!(err, EtlError::Row { line: 21, .. }), "{err:?}");
            assert_eq!(pipeline.state(), PipelineState::Failed);
            assert_eq!(rows(&c.database)?.len(), 20);
        }
        Ok(())
    }

    #[test]
    fn observer_error_aborts_the_run() -> Result<()> {
        let dir = tempdir()?;
        let input = gz(&dir, "synthetic.csv.gz", &synthetic(30))?;
        let mut c = config(&dir, &input);
        c.block_size = 10;
        let mut pipeline = Pipeline::new(c)?;
        let err = pipeline
            .run_observed(|_, p| {
                if p.block == 1 {
                    Err(EtlError::State("stop".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(err.to_string().contains("stop"));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        Ok(())
    }

    #[test]
    fn missing_input_fails_before_the_database_is_created() -> Result<()> {
        let dir = tempdir()?;
        let c = config(&dir, &dir.path().join("nothing-*.zip"));
        let err = Pipeline::new(c.clone())?.run().unwrap_err();
        assert!(matches!(err, EtlError::Source { .. }));
        assert!(!c.database.exists());
        Ok(())
    }

    #[test]
    fn glob_loads_every_match_in_order() -> Result<()> {
        let dir = tempdir()?;
        gz(&dir, "part1.csv.gz", "1;1;1;ATIVA\n2;1;1;ATIVA\n")?;
        gz(&dir, "part0.csv.gz", "3;1;1;ATIVA\n")?;
        let c = config(&dir, &dir.path().join("part*.csv.gz"));
        let report = Pipeline::new(c.clone())?.run()?;
        let files: Vec<&str> = report.files.iter().map(|f| f.file.as_str()).collect();
        assert_eq!(files, ["part0.csv.gz", "part1.csv.gz"]);
        assert_eq!(rows(&c.database)?.len(), 3);
        Ok(())
    }

    #[test]
    fn check_never_opens_the_database() -> Result<()> {
        let dir = tempdir()?;
        let input = gz(&dir, "sample.csv.gz", "1;10;20;ATIVA\n2;;21;ATIVA\n")?;
        let c = config(&dir, &input);
        let reports = Pipeline::new(c.clone())?.check()?;
        assert_eq!(reports[0].transform.transformed, 1);
        assert_eq!(reports[0].transform.dropped, 1);
        assert!(!c.database.exists());
        Ok(())
    }

    #[test]
    fn a_pipeline_runs_once() -> Result<()> {
        let dir = tempdir()?;
        let input = gz(&dir, "s.csv.gz", &synthetic(3))?;
        let mut pipeline = Pipeline::new(config(&dir, &input))?;
        pipeline.run()?;
        assert!(matches!(pipeline.run(), Err(EtlError::State(_))));
        assert_eq!(pipeline.state(), PipelineState::Done);
        Ok(())
    }
}
