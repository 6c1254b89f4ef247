//! # Persisted form of the work store.
//!
//! One JSON document holds every persisted record:
//!
//! ```text
//! { "version": 0,
//!   "jobs": [ { "job_id", "uid", "package", "class",
//!               "constraints": { "charging", "idle", "network" },
//!               "timing": { "kind": "periodic", "period_ms" }
//!                       | { "kind": "one_off", "min_latency_ms"?, "deadline_ms"? },
//!               "delay_wall_ms"?, "deadline_wall_ms"?,
//!               "backoff"?: { "policy", "initial_ms" },
//!               "extras": [ { "key", "type", "value" } ] } ] }
//! ```
//!
//! Run-time bounds live on the elapsed clock, which restarts at boot, so they
//! are written as wall-clock instants and converted back on read. Each record
//! decodes on its own: a bad entry is reported and skipped, never fatal to
//! the batch. Unknown fields are ignored everywhere.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::jobs::backoff::{BackoffKind, BackoffPolicy};
use crate::jobs::extras::{ExtraValue, Extras};
use crate::jobs::record::{ComponentRef, JobKey, NetworkType, Timing, WorkRecord, WorkSpec};

/// Schema version written and accepted.
pub(crate) const FILE_VERSION: u32 = 0;

/// Document as written.
#[derive(Debug, Serialize)]
pub(crate) struct JobsDocument {
    version: u32,
    jobs: Vec<PersistedJob>,
}

impl JobsDocument {
    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Document as read; records stay raw so each one decodes independently.
#[derive(Debug, Deserialize)]
pub(crate) struct RawJobsDocument {
    version: u32,
    #[serde(default)]
    jobs: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedJob {
    job_id: i32,
    uid: u32,
    package: String,
    class: String,
    #[serde(default)]
    constraints: PersistedConstraints,
    timing: PersistedTiming,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_wall_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline_wall_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff: Option<PersistedBackoff>,
    #[serde(default)]
    extras: Vec<PersistedExtra>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedConstraints {
    charging: bool,
    idle: bool,
    network: NetworkType,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PersistedTiming {
    OneOff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_latency_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline_ms: Option<u64>,
    },
    Periodic {
        period_ms: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBackoff {
    policy: BackoffKind,
    initial_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedExtra {
    key: String,
    #[serde(rename = "type")]
    kind: String,
    value: Value,
}

/// A record that could not be decoded.
#[derive(Debug, Clone)]
pub(crate) struct SkippedJob {
    pub job_id: Option<i32>,
    pub uid: Option<u32>,
    pub reason: String,
}

/// A periodic record whose reloaded window was pulled back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClampedJob {
    pub key: JobKey,
    pub latest_before: u64,
    pub latest_after: u64,
}

/// Outcome of decoding a whole document.
#[derive(Debug, Default)]
pub(crate) struct Decoded {
    pub records: Vec<WorkRecord>,
    pub skipped: Vec<SkippedJob>,
    pub clamped: Vec<ClampedJob>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Elapsed-clock instant to wall-clock instant, saturating at 0.
pub(crate) fn elapsed_to_wall(target: u64, elapsed_now: u64, wall_now: u64) -> u64 {
    let wall = i128::from(wall_now) + (i128::from(target) - i128::from(elapsed_now));
    wall.clamp(0, i128::from(u64::MAX)) as u64
}

/// Wall-clock instant to elapsed-clock instant; past instants map to now.
pub(crate) fn wall_to_elapsed(wall: u64, elapsed_now: u64, wall_now: u64) -> u64 {
    elapsed_now.saturating_add(wall.saturating_sub(wall_now))
}

/// Encodes the given (persisted) records at the clock's current instant.
pub(crate) fn encode<'a>(
    records: impl IntoIterator<Item = &'a WorkRecord>,
    clock: &dyn Clock,
) -> JobsDocument {
    let wall_now = clock.wall_ms();
    let elapsed_now = clock.elapsed_ms();
    let jobs = records
        .into_iter()
        .map(|rec| encode_job(rec, elapsed_now, wall_now))
        .collect();
    JobsDocument {
        version: FILE_VERSION,
        jobs,
    }
}

fn encode_job(rec: &WorkRecord, elapsed_now: u64, wall_now: u64) -> PersistedJob {
    let spec = rec.spec();
    let constraints = spec.constraints();
    let timing = match *spec.timing() {
        Timing::OneShot {
            min_latency,
            deadline,
        } => PersistedTiming::OneOff {
            min_latency_ms: min_latency.map(millis),
            deadline_ms: deadline.map(millis),
        },
        Timing::Periodic { interval } => PersistedTiming::Periodic {
            period_ms: millis(interval),
        },
    };
    let backoff = (!spec.backoff().is_default()).then(|| PersistedBackoff {
        policy: spec.backoff().kind,
        initial_ms: millis(spec.backoff().initial),
    });

    PersistedJob {
        job_id: spec.id(),
        uid: rec.uid(),
        package: spec.component().package.clone(),
        class: spec.component().class.clone(),
        constraints: PersistedConstraints {
            charging: constraints.requires_charging,
            idle: constraints.requires_idle,
            network: constraints.network,
        },
        timing,
        delay_wall_ms: rec
            .earliest_run_ms()
            .map(|t| elapsed_to_wall(t, elapsed_now, wall_now)),
        deadline_wall_ms: rec
            .latest_run_ms()
            .map(|t| elapsed_to_wall(t, elapsed_now, wall_now)),
        backoff,
        extras: spec.extras().iter().map(|(k, v)| encode_extra(k, v)).collect(),
    }
}

fn encode_extra(key: &str, value: &ExtraValue) -> PersistedExtra {
    let json = match value {
        ExtraValue::Int(i) => Value::from(*i),
        ExtraValue::Long(l) => Value::from(*l),
        // JSON has no NaN or infinities; those go through their string form.
        ExtraValue::Double(d) => serde_json::Number::from_f64(*d)
            .map_or_else(|| Value::String(d.to_string()), Value::Number),
        ExtraValue::Str(s) => Value::String(s.clone()),
    };
    PersistedExtra {
        key: key.to_string(),
        kind: value.type_tag().to_string(),
        value: json,
    }
}

/// Decodes a document read from disk at the clock's current instant.
///
/// # Errors
/// Returns [`StoreError::UnsupportedVersion`] when the document version is
/// not [`FILE_VERSION`]; nothing is decoded in that case.
pub(crate) fn decode(doc: RawJobsDocument, clock: &dyn Clock) -> Result<Decoded, StoreError> {
    if doc.version != FILE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: doc.version,
            expected: FILE_VERSION,
        });
    }

    let wall_now = clock.wall_ms();
    let elapsed_now = clock.elapsed_ms();
    let mut out = Decoded::default();

    for raw in doc.jobs {
        let job_id = raw
            .get("job_id")
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok());
        let uid = raw
            .get("uid")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok());

        let decoded = serde_json::from_value::<PersistedJob>(raw)
            .map_err(|e| e.to_string())
            .and_then(|job| decode_job(job, elapsed_now, wall_now));

        match decoded {
            Ok((record, clamp)) => {
                if let Some(c) = clamp {
                    out.clamped.push(c);
                }
                out.records.push(record);
            }
            Err(reason) => out.skipped.push(SkippedJob {
                job_id,
                uid,
                reason,
            }),
        }
    }
    Ok(out)
}

fn decode_job(
    job: PersistedJob,
    elapsed_now: u64,
    wall_now: u64,
) -> Result<(WorkRecord, Option<ClampedJob>), String> {
    let mut builder = WorkSpec::builder(job.job_id, ComponentRef::new(job.package, job.class))
        .requires_charging(job.constraints.charging)
        .requires_idle(job.constraints.idle)
        .network(job.constraints.network)
        .persisted(true);

    match job.timing {
        PersistedTiming::OneOff {
            min_latency_ms,
            deadline_ms,
        } => {
            if let Some(ms) = min_latency_ms {
                builder = builder.min_latency(Duration::from_millis(ms));
            }
            if let Some(ms) = deadline_ms {
                builder = builder.override_deadline(Duration::from_millis(ms));
            }
        }
        PersistedTiming::Periodic { period_ms } => {
            builder = builder.periodic(Duration::from_millis(period_ms));
        }
    }
    if let Some(b) = job.backoff {
        builder = builder.backoff(BackoffPolicy::new(b.policy, Duration::from_millis(b.initial_ms)));
    }

    let mut extras = Extras::new();
    for extra in job.extras {
        let value = decode_extra(&extra)?;
        extras.put(extra.key, value);
    }
    let spec = builder.extras(extras).try_build().map_err(|e| e.to_string())?;

    let earliest = job
        .delay_wall_ms
        .map(|w| wall_to_elapsed(w, elapsed_now, wall_now));
    let latest = job
        .deadline_wall_ms
        .map(|w| wall_to_elapsed(w, elapsed_now, wall_now));

    let Timing::Periodic { interval } = *spec.timing() else {
        return Ok((WorkRecord::with_run_times(spec, job.uid, earliest, latest), None));
    };

    let period = millis(interval);
    let earliest = earliest.unwrap_or(elapsed_now);
    let latest = latest.unwrap_or_else(|| earliest.saturating_add(period));
    let max_latest = elapsed_now.saturating_add(period.saturating_mul(2));

    let (earliest, latest, clamp) = if latest > max_latest {
        let clamp = ClampedJob {
            key: JobKey {
                uid: job.uid,
                job_id: job.job_id,
            },
            latest_before: latest,
            latest_after: max_latest,
        };
        (max_latest - period, max_latest, Some(clamp))
    } else {
        (earliest, latest, None)
    };

    Ok((
        WorkRecord::with_run_times(spec, job.uid, Some(earliest), Some(latest)),
        clamp,
    ))
}

fn decode_extra(extra: &PersistedExtra) -> Result<ExtraValue, String> {
    let bad = || format!("extra {:?}: bad {} value {}", extra.key, extra.kind, extra.value);
    match extra.kind.as_str() {
        "int" => extra
            .value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(ExtraValue::Int)
            .ok_or_else(bad),
        "long" => extra.value.as_i64().map(ExtraValue::Long).ok_or_else(bad),
        "double" => match &extra.value {
            Value::Number(n) => n.as_f64().map(ExtraValue::Double).ok_or_else(bad),
            Value::String(s) => s.parse::<f64>().map(ExtraValue::Double).map_err(|_| bad()),
            _ => Err(bad()),
        },
        "string" => extra
            .value
            .as_str()
            .map(|s| ExtraValue::Str(s.to_string()))
            .ok_or_else(bad),
        other => Err(format!("extra {:?}: unknown type {other:?}", extra.key)),
    }
}
