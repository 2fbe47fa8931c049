//! Session assembly and the multi-session build.
//!
//! ```text
//!            ┌──────────── job queue (session indices) ────────────┐
//!            ▼                      ▼                              ▼
//!        worker 1               worker 2          ...          worker N
//!   grid → labels → features (one session each, no shared state)
//!            │                      │                              │
//!            └────────── results (index, Result<SessionOutput>) ───┘
//!                                   ▼
//!        failure policy → reconcile → concat → split → validate → manifest
//! ```

use crossbeam_channel::unbounded;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::features::{feature_schema, FeatureStream, StreamFeatures};
use super::grid::TimeGrid;
use super::keywords::KeywordSet;
use super::labeling::{EventLabeler, LabelSet};
use super::split::{SplitPlan, SplitPlanner};
use super::table::{reconcile_schemas, ColumnSpec, MasterTable, SessionTable};
use crate::config::{FailurePolicy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::ingest::SessionInput;
use crate::manifest::{BuildManifest, DataQualityFlag, ExcludedSession, SessionSummary};

/// Everything produced for one session.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub table: SessionTable,
    pub summary: SessionSummary,
}

/// Result of a full build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub master: MasterTable,
    pub manifest: BuildManifest,
    pub plan: SplitPlan,
}

/// Builds per-session tables and the partitioned master table.
///
/// Holds only compiled, read-only state, so one assembler is shared by
/// reference across all workers.
#[derive(Debug, Clone)]
pub struct FeatureAssembler<'a> {
    config: &'a PipelineConfig,
    labeler: EventLabeler,
    keywords: KeywordSet,
}

impl<'a> FeatureAssembler<'a> {
    pub fn new(config: &'a PipelineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config,
            labeler: EventLabeler::new(config)?,
            keywords: KeywordSet::new(config.text.keyword_flags.clone())?,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        self.config
    }

    pub fn labeler(&self) -> &EventLabeler {
        &self.labeler
    }

    /// Feature columns every session produces under this configuration.
    pub fn schema(&self) -> Vec<ColumnSpec> {
        feature_schema(self.config, &self.keywords)
    }

    /// Grid, labels and features for one session.
    pub fn assemble_session(&self, input: &SessionInput) -> Result<SessionOutput> {
        let input = input.prepared()?;
        let session = &input.session;
        let grid = TimeGrid::build(session, &self.config.grid)?;

        let mut flags = Vec::new();
        for stream in input.missing_streams() {
            let err = PipelineError::MissingUpstreamData {
                session_id: session.session_id.clone(),
                stream,
            };
            warn!(error = %err, "Stream features will be sentinel");
            flags.push(DataQualityFlag::MissingStream { stream });
        }

        let messages = input.race_control.as_deref().unwrap_or_default();
        let labels = self.labeler.label(&grid, messages, session.end);
        flags.extend(label_flags(&labels));

        let mut columns = Vec::new();
        for stream in FeatureStream::for_session(&input, self.config, &self.keywords) {
            columns.extend(stream.extract(&grid));
        }

        debug!(
            session_id = %session.session_id,
            grid_points = grid.len(),
            events = labels.events.len(),
            positives = labels.positive_count(),
            "Assembled session"
        );

        let summary = SessionSummary {
            session_id: session.session_id.clone(),
            group_key: session.group_key.clone(),
            start: session.start,
            end: session.end,
            grid_points: grid.len(),
            positive_points: labels.positive_count(),
            events: labels.events,
            ambiguous_messages: labels.ambiguous.len(),
            flags,
        };

        let table = SessionTable {
            session: session.clone(),
            timestamps: grid.points().to_vec(),
            labels: labels.labels,
            time_to_event: labels.time_to_event,
            columns,
        };

        Ok(SessionOutput { table, summary })
    }

    /// Assemble every session, apply the failure policy, then concatenate
    /// and split.
    pub fn build(&self, inputs: &[SessionInput]) -> Result<BuildOutput> {
        let mut ids = BTreeSet::new();
        for input in inputs {
            if !ids.insert(input.session.session_id.as_str()) {
                return Err(PipelineError::DuplicateSession(input.session.session_id.clone()));
            }
        }

        let results = self.assemble_all(inputs);

        let mut outputs = Vec::with_capacity(inputs.len());
        let mut excluded = Vec::new();
        for (input, result) in inputs.iter().zip(results) {
            match result {
                Ok(output) => outputs.push(output),
                Err(err) if err.is_session_scoped() => match self.config.build.failure_policy {
                    FailurePolicy::Abort => return Err(err),
                    FailurePolicy::Exclude => {
                        warn!(
                            session_id = %input.session.session_id,
                            error = %err,
                            "Excluded session from build"
                        );
                        excluded.push(ExcludedSession {
                            session_id: input.session.session_id.clone(),
                            reason: err.to_string(),
                        });
                    }
                },
                Err(err) => return Err(err),
            }
        }

        if outputs.is_empty() {
            return Err(PipelineError::EmptyBuild);
        }

        outputs.sort_by(|a, b| {
            (a.table.session.start, &a.table.session.session_id)
                .cmp(&(b.table.session.start, &b.table.session.session_id))
        });
        let (mut tables, summaries): (Vec<SessionTable>, Vec<SessionSummary>) = outputs
            .into_iter()
            .map(|o| (o.table, o.summary))
            .unzip();

        reconcile_schemas(&mut tables)?;
        let mut master = MasterTable::concat(tables)?;

        let planner = SplitPlanner::new(&self.config.split);
        let plan = planner.plan(&master);
        planner.apply(&plan, &mut master)?;
        SplitPlanner::validate(&master)?;

        let manifest = BuildManifest::new(
            self.config.fingerprint(),
            inputs.len(),
            &master,
            summaries,
            excluded,
        );

        info!(
            sessions = manifest.sessions_included,
            excluded = manifest.excluded.len(),
            rows = manifest.rows,
            positives = manifest.positive_rows,
            "Build complete"
        );

        Ok(BuildOutput {
            master,
            manifest,
            plan,
        })
    }

    /// Run `assemble_session` for every input; results come back in input order.
    fn assemble_all(&self, inputs: &[SessionInput]) -> Vec<Result<SessionOutput>> {
        let workers = self.config.build.worker_count(inputs.len());
        if workers <= 1 {
            return inputs.iter().map(|input| self.assemble_session(input)).collect();
        }

        let (job_tx, job_rx) = unbounded::<usize>();
        let (result_tx, result_rx) = unbounded::<(usize, Result<SessionOutput>)>();
        for index in 0..inputs.len() {
            // The receiver is alive in this scope
            let _ = job_tx.send(index);
        }
        drop(job_tx);

        debug!(workers, sessions = inputs.len(), "Starting session workers");

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for index in job_rx.iter() {
                        let result = self.assemble_session(&inputs[index]);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut results: Vec<(usize, Result<SessionOutput>)> = result_rx.iter().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

fn label_flags(labels: &LabelSet) -> Vec<DataQualityFlag> {
    let mut flags = Vec::new();
    if labels.events.is_empty() {
        flags.push(DataQualityFlag::NoInterventionsDetected);
    }
    if !labels.ambiguous.is_empty() {
        flags.push(DataQualityFlag::AmbiguousMessages {
            count: labels.ambiguous.len(),
        });
    }
    if labels.unpaired_ends > 0 {
        flags.push(DataQualityFlag::UnpairedEndMarkers {
            count: labels.unpaired_ends,
        });
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::split::Partition;
    use crate::ingest::{RaceControlMessage, SessionMeta, StreamName};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap()
    }

    fn session(id: &str, group: &str, week: i64) -> SessionInput {
        let start = base() + Duration::weeks(week);
        SessionInput::new(SessionMeta::new(id, group, start, start + Duration::minutes(60)))
            .with_race_control(vec![
                RaceControlMessage::new(start + Duration::minutes(20), "SAFETY CAR DEPLOYED")
                    .with_category("SafetyCar"),
                RaceControlMessage::new(start + Duration::minutes(25), "SAFETY CAR IN THIS LAP")
                    .with_category("SafetyCar"),
            ])
            .with_weather(Vec::new())
            .with_position(Vec::new())
            .with_intervals(Vec::new())
    }

    #[test]
    fn test_assemble_session_shapes() {
        let config = PipelineConfig::default();
        let assembler = FeatureAssembler::new(&config).unwrap();
        let output = assembler.assemble_session(&session("a", "g1", 0)).unwrap();

        assert_eq!(output.table.len(), 121);
        assert_eq!(output.table.schema(), assembler.schema());
        assert_eq!(output.summary.events.len(), 1);
        assert_eq!(output.summary.positive_points, 10);
        assert!(output.summary.flags.is_empty());
    }

    #[test]
    fn test_missing_stream_is_flagged() {
        let config = PipelineConfig::default();
        let assembler = FeatureAssembler::new(&config).unwrap();
        let mut input = session("a", "g1", 0);
        input.weather = None;

        let output = assembler.assemble_session(&input).unwrap();
        assert_eq!(
            output.summary.flags,
            vec![DataQualityFlag::MissingStream {
                stream: StreamName::Weather
            }]
        );
    }

    #[test]
    fn test_invalid_session_is_excluded() {
        let config = PipelineConfig::default();
        let assembler = FeatureAssembler::new(&config).unwrap();
        let mut bad = session("bad", "g3", 2);
        bad.session.end = bad.session.start;

        let output = assembler
            .build(&[session("a", "g1", 0), session("b", "g2", 1), bad])
            .unwrap();

        assert_eq!(output.manifest.sessions_included, 2);
        assert_eq!(output.manifest.excluded.len(), 1);
        assert_eq!(output.manifest.excluded[0].session_id, "bad");
        assert!(output.manifest.is_complete());
    }

    #[test]
    fn test_out_of_range_sessions_are_excluded() {
        let config = PipelineConfig::default();
        let assembler = FeatureAssembler::new(&config).unwrap();

        let mut typo = session("typo", "g2", 1);
        typo.session.end = typo.session.start + Duration::days(365);
        let end = DateTime::<Utc>::MAX_UTC;
        let far_start = end - Duration::seconds(45);
        let far = SessionInput::new(SessionMeta::new("far", "g3", far_start, end));

        let output = assembler
            .build(&[session("a", "g1", 0), typo, far])
            .unwrap();

        assert_eq!(output.manifest.sessions_included, 1);
        let excluded: Vec<&str> = output
            .manifest
            .excluded
            .iter()
            .map(|e| e.session_id.as_str())
            .collect();
        assert_eq!(excluded, vec!["typo", "far"]);
        assert!(output.manifest.is_complete());
        assert_eq!(output.master.len(), 121);
    }

    #[test]
    fn test_abort_policy_fails_build() {
        let mut config = PipelineConfig::default();
        config.build.failure_policy = FailurePolicy::Abort;
        let assembler = FeatureAssembler::new(&config).unwrap();
        let mut bad = session("bad", "g3", 2);
        bad.session.end = bad.session.start;

        let result = assembler.build(&[session("a", "g1", 0), bad]);
        assert!(matches!(result, Err(PipelineError::InvalidSessionBounds { .. })));
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let config = PipelineConfig::default();
        let assembler = FeatureAssembler::new(&config).unwrap();
        let result = assembler.build(&[session("a", "g1", 0), session("a", "g2", 1)]);
        assert!(matches!(result, Err(PipelineError::DuplicateSession(id)) if id == "a"));
    }

    #[test]
    fn test_all_sessions_failing_is_empty_build() {
        let config = PipelineConfig::default();
        let assembler = FeatureAssembler::new(&config).unwrap();
        let mut bad = session("bad", "g1", 0);
        bad.session.end = bad.session.start;
        assert!(matches!(assembler.build(&[bad]), Err(PipelineError::EmptyBuild)));
    }

    #[test]
    fn test_parallel_and_sequential_builds_agree() {
        let inputs: Vec<SessionInput> = (0..6)
            .rev()
            .map(|i| session(&format!("s{i}"), &format!("g{}", i / 2), i))
            .collect();

        let mut sequential = PipelineConfig::default();
        sequential.build.workers = 1;
        let mut parallel = PipelineConfig::default();
        parallel.build.workers = 4;

        let a = FeatureAssembler::new(&sequential).unwrap().build(&inputs).unwrap();
        let b = FeatureAssembler::new(&parallel).unwrap().build(&inputs).unwrap();

        assert_eq!(a.master, b.master);
        assert_eq!(a.manifest.summaries, b.manifest.summaries);
        // Rows are ordered by session start regardless of input order
        assert_eq!(a.master.session_ids.first().map(String::as_str), Some("s0"));
        assert!(!a.master.partition_rows(Partition::Test).is_empty());
    }
}
