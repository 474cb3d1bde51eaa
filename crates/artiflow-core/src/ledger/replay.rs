use std::collections::BTreeMap;

use uuid::Uuid;

use super::{LedgerEntry, LedgerEntryKind};
use crate::model::{AttemptOutcome, Run, RunStatus, StageState};
use crate::stage::StageStatus;

/// Pliega las entradas de un run en orden de append. Función pura: la misma
/// secuencia produce siempre el mismo `Run`.
pub fn replay_entries(run_id: Uuid, entries: &[LedgerEntry]) -> Run {
    let mut run = Run { run_id,
                        definition_hash: String::new(),
                        stage_ids: Vec::new(),
                        status: RunStatus::Running,
                        attempts: Vec::new(),
                        stages: BTreeMap::new(),
                        failure: None };

    for entry in entries {
        match &entry.kind {
            LedgerEntryKind::RunStarted { definition_hash, stage_ids } => {
                run.definition_hash = definition_hash.clone();
                run.stage_ids = stage_ids.clone();
                for id in stage_ids {
                    run.stages.entry(id.clone()).or_default();
                }
            }
            LedgerEntryKind::Attempt(attempt) => {
                let slot: &mut StageState = run.stages.entry(attempt.stage_id.clone()).or_default();
                slot.attempts = slot.attempts.max(attempt.attempt_number);
                slot.status = match attempt.outcome {
                    AttemptOutcome::Started => StageStatus::Running,
                    AttemptOutcome::Success => StageStatus::Succeeded,
                    AttemptOutcome::Failed | AttemptOutcome::TimedOut => StageStatus::Failed,
                };
                if attempt.outcome == AttemptOutcome::Success {
                    slot.output_versions = attempt.output_versions.clone();
                }
                if attempt.outcome == AttemptOutcome::Started {
                    slot.confirmed = false;
                }
                slot.last = Some(attempt.clone());
                run.attempts.push(attempt.clone());
            }
            LedgerEntryKind::OperatorConfirmed { stage_id } => {
                run.stages.entry(stage_id.clone()).or_default().confirmed = true;
            }
            LedgerEntryKind::RunFinished { status, failure } => {
                if run.status.can_transition_to(*status) {
                    run.status = *status;
                    run.failure = failure.clone();
                }
            }
        }
    }
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageFailure;
    use crate::model::Attempt;
    use chrono::{TimeZone, Utc};

    fn entry(seq: u64, run_id: Uuid, kind: LedgerEntryKind) -> LedgerEntry {
        LedgerEntry { seq,
                      run_id,
                      ts: Utc.timestamp_opt(seq as i64, 0).single().expect("ts"),
                      kind }
    }

    fn sample(run_id: Uuid) -> Vec<LedgerEntry> {
        let t = Utc.timestamp_opt(0, 0).single().expect("ts");
        let fetch = Attempt::started("fetch", 1, t);
        let transform = Attempt::started("transform", 1, t);
        vec![entry(0,
                   run_id,
                   LedgerEntryKind::RunStarted { definition_hash: "h".into(),
                                                 stage_ids: vec!["fetch".into(), "transform".into()] }),
             entry(1, run_id, LedgerEntryKind::Attempt(fetch.clone())),
             entry(2,
                   run_id,
                   LedgerEntryKind::Attempt(fetch.succeeded(t, BTreeMap::from([("raw".to_string(), 1)])))),
             entry(3, run_id, LedgerEntryKind::Attempt(transform.clone())),
             entry(4,
                   run_id,
                   LedgerEntryKind::Attempt(transform.failed(t, &StageFailure::permanent("bad json")))),
             entry(5,
                   run_id,
                   LedgerEntryKind::RunFinished { status: RunStatus::Failed, failure: None })]
    }

    #[test]
    fn replay_is_deterministic() {
        let run_id = Uuid::new_v4();
        let entries = sample(run_id);
        assert_eq!(replay_entries(run_id, &entries), replay_entries(run_id, &entries));
    }

    #[test]
    fn replay_tracks_stage_states() {
        let run_id = Uuid::new_v4();
        let run = replay_entries(run_id, &sample(run_id));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage_status("fetch"), StageStatus::Succeeded);
        assert_eq!(run.stage("fetch").map(|s| s.output_versions.get("raw").copied()), Some(Some(1)));
        assert_eq!(run.stage_status("transform"), StageStatus::Failed);
        assert_eq!(run.finished_attempts("transform").len(), 1);
        assert_eq!(run.attempts.len(), 4);
    }

    #[test]
    fn open_attempt_is_in_flight() {
        let run_id = Uuid::new_v4();
        let mut entries = sample(run_id);
        entries.truncate(4);
        let run = replay_entries(run_id, &entries);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.stage("transform").is_some_and(|s| s.in_flight()));
    }

    #[test]
    fn finished_status_is_never_overwritten() {
        let run_id = Uuid::new_v4();
        let mut entries = sample(run_id);
        entries.push(entry(6, run_id, LedgerEntryKind::RunFinished { status: RunStatus::Succeeded, failure: None }));
        assert_eq!(replay_entries(run_id, &entries).status, RunStatus::Failed);
    }
}
