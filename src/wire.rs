//! Builds the outbound wire records: completion, log, and job-error. All
//! three are framed with [`crate::frame::encode`].

use crate::error::JobErrorCode;
use crate::frame::Pairs;
use crate::job::Job;
use crate::reaper::exited_normally;
use crate::time::{timeval_to_wire_string, TimeVal};

fn push(pairs: &mut Pairs, key: &str, value: impl Into<Vec<u8>>) {
    pairs.push((key.to_string(), value.into()));
}

fn push_str(pairs: &mut Pairs, key: &str, value: impl AsRef<str>) {
    push(pairs, key, value.as_ref().as_bytes().to_vec());
}

/// Build the completion record for a job that has run to some conclusion:
/// normal exit, timeout, or stale-reap.
///
/// `error` is `Some(code)` for timeout/stale paths (`exited_ok=0`); `None`
/// for a normal reap (`exited_ok=1`, carries rusage).
pub fn completion_record(job: &Job, error: Option<JobErrorCode>) -> Pairs {
    let mut pairs: Pairs = Vec::with_capacity(12 + job.request.len());

    // Echo the original request verbatim (env already filtered at spawn time).
    for (k, v) in &job.request {
        pairs.push((k.clone(), v.clone()));
    }

    let wait_status = job.result.wait_status.unwrap_or(0);
    push_str(&mut pairs, "wait_status", wait_status.to_string());
    push_str(&mut pairs, "start", job.start.to_wire_string());

    let stop = job.result.stop.unwrap_or_else(TimeVal::now);
    push_str(&mut pairs, "stop", stop.to_wire_string());
    push_str(
        &mut pairs,
        "runtime",
        format!("{:.6}", job.start.delta_secs_f64(stop)),
    );

    match error {
        None => {
            push_str(&mut pairs, "exited_ok", "1");
            if let Some(ru) = job.result.rusage {
                push_str(&mut pairs, "ru_utime", timeval_to_wire_string(ru.ru_utime));
                push_str(&mut pairs, "ru_stime", timeval_to_wire_string(ru.ru_stime));
                push_str(&mut pairs, "ru_minflt", ru.ru_minflt.to_string());
                push_str(&mut pairs, "ru_majflt", ru.ru_majflt.to_string());
                push_str(&mut pairs, "ru_inblock", ru.ru_inblock.to_string());
                push_str(&mut pairs, "ru_oublock", ru.ru_oublock.to_string());
            }
        }
        Some(code) => {
            push_str(&mut pairs, "exited_ok", "0");
            push_str(&mut pairs, "error_code", code.as_wire_str());
        }
    }

    push(&mut pairs, "outerr", job.stderr.data.clone());
    push(&mut pairs, "outstd", job.stdout.data.clone());

    pairs
}

/// True if the wait status in `pairs` (via the raw `libc` status) reflects a
/// normal exit. Exposed for tests that want to sanity-check scenario
/// expectations without re-deriving the bit test.
pub fn wait_status_exited_normally(status: i32) -> bool {
    exited_normally(status)
}

/// A `log=<message>` record.
pub fn log_record(message: &str) -> Pairs {
    vec![("log".to_string(), message.as_bytes().to_vec())]
}

/// A job-error record: used when a job never enters the running state
/// (parse failure or spawn failure). `job_id` is `None` when the request
/// itself couldn't be parsed far enough to recover an id.
pub fn job_error_record(job_id: Option<u32>, message: &str) -> Pairs {
    let mut pairs = Pairs::new();
    if let Some(id) = job_id {
        push_str(&mut pairs, "job_id", id.to_string());
    }
    push_str(&mut pairs, "error_msg", message);
    pairs
}
