use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::envelope::{Envelope, Rank};
use crate::bus::frame;
use crate::error::{FleetError, Result};
use crate::job::JobRecord;
use crate::protocol::{Command, LaunchInstruction, ProcLaunch};

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    Ok(serde_json::from_slice(&envelope.payload)?)
}

/// Add-processes instruction for `ranks` of `job`, each of which must already
/// carry its new host.
pub fn launch_instruction(job: &JobRecord, ranks: &[Rank]) -> Result<LaunchInstruction> {
    let mut procs = Vec::with_capacity(ranks.len());
    for rank in ranks {
        let proc = job
            .procs
            .get(rank)
            .ok_or_else(|| FleetError::InvalidJob(format!("job {} has no rank {}", job.id, rank)))?;
        let (Some(daemon), Some(node)) = (proc.daemon, proc.node.clone()) else {
            return Err(FleetError::InvalidJob(format!("{} has no host", proc.name)));
        };
        procs.push(ProcLaunch {
            rank: *rank,
            app_index: proc.app_index,
            daemon,
            node,
            restarts: proc.restarts,
        });
    }
    Ok(LaunchInstruction {
        job: job.id,
        recovery_enabled: job.recovery_enabled,
        apps: job.apps.clone(),
        procs,
    })
}

/// Launch instructions for `ranks` of `job`, at most `batch` processes each.
pub fn launch_batches(job: &JobRecord, ranks: &[Rank], batch: usize) -> Result<Vec<LaunchInstruction>> {
    ranks
        .chunks(batch.max(1))
        .map(|chunk| launch_instruction(job, chunk))
        .collect()
}

/// Serialized add-processes command, refused if no transport could carry it.
pub fn encode_launch_instruction(instruction: &LaunchInstruction) -> Result<Vec<u8>> {
    let payload = encode(&Command::Launch(instruction.clone()))?;
    frame::check_size(payload.len())?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{Channel, PeerIdentity, Tag};
    use crate::bus::transport::TransportError;
    use crate::job::{AppSpec, JobSpec, ProcessState};

    fn job() -> JobRecord {
        let spec = JobSpec::new("j", vec![AppSpec::new("w", vec!["/bin/w".into()], 2)]);
        JobRecord::from_spec(9, &spec).unwrap()
    }

    #[test]
    fn instruction_carries_hosts_and_apps() {
        let mut job = job();
        let d = PeerIdentity::new(1, 2);
        for proc in job.procs.values_mut() {
            proc.daemon = Some(d);
            proc.node = Some("n1".into());
            proc.state = ProcessState::Launching;
        }
        job.procs.get_mut(&1).unwrap().restarts = 3;

        let instr = launch_instruction(&job, &[1]).unwrap();
        assert_eq!(instr.job, 9);
        assert_eq!(instr.apps.len(), 1);
        assert_eq!(instr.procs.len(), 1);
        assert_eq!(instr.procs[0].restarts, 3);
        assert_eq!(instr.procs[0].daemon, d);
    }

    #[test]
    fn large_placement_is_split_into_batches() {
        let spec = JobSpec::new("wide", vec![AppSpec::new("w", vec!["/bin/w".into()], 1500)]);
        let mut job = JobRecord::from_spec(2, &spec).unwrap();
        for proc in job.procs.values_mut() {
            proc.daemon = Some(PeerIdentity::new(1, 2 + proc.name.rank % 2));
            proc.node = Some(format!("n{}", proc.name.rank % 2));
        }
        let ranks: Vec<Rank> = job.procs.keys().copied().collect();

        let batches = launch_batches(&job, &ranks, 256).unwrap();
        assert_eq!(batches.len(), 6);
        assert_eq!(batches.iter().map(|b| b.procs.len()).sum::<usize>(), 1500);
        assert!(batches.iter().all(|b| b.procs.len() <= 256));
        for batch in &batches {
            let payload = encode_launch_instruction(batch).unwrap();
            assert!(payload.len() < frame::PART_BYTES, "batch of {} bytes", payload.len());
        }
    }

    #[test]
    fn oversized_instruction_is_refused() {
        let spec = JobSpec::new("fat", vec![AppSpec::new("w", vec!["x".repeat(frame::MAX_MESSAGE_BYTES)], 1)]);
        let mut job = JobRecord::from_spec(3, &spec).unwrap();
        let proc = job.procs.get_mut(&0).unwrap();
        proc.daemon = Some(PeerIdentity::new(1, 2));
        proc.node = Some("n1".into());

        let instr = launch_instruction(&job, &[0]).unwrap();
        let err = encode_launch_instruction(&instr).unwrap_err();
        assert!(matches!(
            err,
            FleetError::Transport(TransportError::TooLarge { .. })
        ));
    }

    #[test]
    fn unplaced_rank_is_refused() {
        let job = job();
        assert!(launch_instruction(&job, &[0]).is_err());
        assert!(launch_instruction(&job, &[5]).is_err());
    }

    #[test]
    fn decode_reads_envelope_payload() {
        let envelope = Envelope {
            sender: PeerIdentity::scheduler(1),
            target: None,
            channel: Channel::SystemControl,
            tag: Tag::Command,
            seq: 0,
            payload: encode(&Command::Kill { job: 3, rank: None }).unwrap(),
        };
        let command: Command = decode(&envelope).unwrap();
        assert_eq!(command, Command::Kill { job: 3, rank: None });
    }
}
