use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use kbisect_store::{SessionRecord, Store, StoreResult};

/// Seconds between two stored timestamps, when both parse.
fn duration_secs(start: &str, end: Option<&str>) -> Option<i64> {
    let start = OffsetDateTime::parse(start, &Rfc3339).ok()?;
    let end = OffsetDateTime::parse(end?, &Rfc3339).ok()?;
    Some((end - start).whole_seconds())
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}

pub fn render_text(store: &Store, session: &SessionRecord) -> StoreResult<String> {
    use std::fmt::Write;

    let summary = store.summary(session.session_id)?;
    let iterations = store.iterations(session.session_id)?;

    let mut out = String::new();
    let _ = writeln!(out, "bisection session {}", summary.session_id);
    let _ = writeln!(out, "  good:   {}", summary.good_ref);
    let _ = writeln!(out, "  bad:    {}", summary.bad_ref);
    let _ = writeln!(out, "  status: {}", summary.status);
    let _ = writeln!(
        out,
        "  iterations: {} ({} good, {} bad, {} skip, {} pending)",
        summary.iteration_count,
        summary.good_count,
        summary.bad_count,
        summary.skip_count,
        summary.pending_count
    );

    if !iterations.is_empty() {
        let _ = writeln!(out);
        for iteration in &iterations {
            let duration = duration_secs(&iteration.started_at, iteration.ended_at.as_deref())
                .map(|secs| format!("{secs}s"))
                .unwrap_or_else(|| "-".to_owned());
            let _ = writeln!(
                out,
                "  {:3}. {} | {:7} | {:>6} | {}",
                iteration.index,
                short(&iteration.commit_sha),
                iteration.verdict.as_key(),
                duration,
                iteration.commit_message.as_deref().unwrap_or("")
            );
            for outcome in store.host_outcomes(iteration.iteration_id)? {
                let _ = writeln!(
                    out,
                    "       [{}] {} at {}{}",
                    outcome.host,
                    outcome.verdict.as_key(),
                    outcome.phase.as_key(),
                    outcome
                        .error
                        .as_deref()
                        .map(|detail| format!(": {detail}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    let _ = writeln!(out);
    match (&summary.status[..], &summary.result_commit) {
        ("completed", Some(first_bad)) => {
            let _ = writeln!(out, "first bad commit: {first_bad}");
        }
        ("completed", None) => {
            let _ = writeln!(
                out,
                "result: inconclusive (only skipped candidates remained)"
            );
        }
        ("halted", _) => {
            let _ = writeln!(out, "session is halted; run `kbisect start` to resume");
        }
        _ => {}
    }
    Ok(out)
}

pub fn render_json(store: &Store, session: &SessionRecord) -> StoreResult<serde_json::Value> {
    let summary = store.summary(session.session_id)?;
    let iterations = store.iterations(session.session_id)?;

    let mut iteration_values = Vec::with_capacity(iterations.len());
    for iteration in &iterations {
        let outcomes = store
            .host_outcomes(iteration.iteration_id)?
            .into_iter()
            .map(|outcome| {
                serde_json::json!({
                    "host": outcome.host.as_str(),
                    "phase": outcome.phase.as_key(),
                    "verdict": outcome.verdict.as_key(),
                    "observed_kernel": outcome.observed_kernel,
                    "error_kind": outcome.error_kind.map(|kind| kind.as_key()),
                    "error": outcome.error,
                })
            })
            .collect::<Vec<_>>();
        iteration_values.push(serde_json::json!({
            "index": iteration.index,
            "commit": iteration.commit_sha,
            "message": iteration.commit_message,
            "verdict": iteration.verdict.as_key(),
            "started_at": iteration.started_at,
            "ended_at": iteration.ended_at,
            "duration_secs": duration_secs(&iteration.started_at, iteration.ended_at.as_deref()),
            "error": iteration.error_summary,
            "hosts": outcomes,
        }));
    }

    Ok(serde_json::json!({
        "session": summary,
        "iterations": iteration_values,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kbisect_core::{HostId, HostOutcome, HostVerdict, IterationVerdict, Phase, SessionStatus};
    use kbisect_store::Store;

    use super::{duration_secs, render_json, render_text};

    fn seeded_store() -> (Arc<Store>, kbisect_core::SessionId) {
        let store = Arc::new(Store::in_memory().expect("open store"));
        let (session, _) = store
            .get_or_create_session("v6.1", "v6.6", "{}")
            .expect("create session");
        let iteration = store
            .create_iteration(session, 1, &"a".repeat(40), "sched: break things")
            .expect("create iteration");
        store
            .put_host_outcome(
                iteration,
                &HostOutcome::new(HostId::new("h1"), Phase::Done, HostVerdict::Fail),
            )
            .expect("store outcome");
        store
            .begin_iteration_close(iteration, IterationVerdict::Bad, None)
            .expect("begin close");
        store
            .finish_iteration_close(iteration)
            .expect("finish close");
        store
            .update_session_status(session, SessionStatus::Completed, Some(&"a".repeat(40)))
            .expect("complete session");
        (store, session)
    }

    #[test]
    fn stored_timestamps_parse_as_rfc3339() {
        let (store, session) = seeded_store();
        let iteration = &store.iterations(session).expect("iterations")[0];
        assert!(duration_secs(
            &iteration.started_at,
            iteration.ended_at.as_deref()
        )
        .is_some());
    }

    #[test]
    fn text_report_names_the_first_bad_commit() {
        let (store, session) = seeded_store();
        let record = store.session(session).expect("read session");
        let rendered = render_text(&store, &record).expect("render");
        assert!(rendered.contains("first bad commit"));
        assert!(rendered.contains(&"a".repeat(40)));
        assert!(rendered.contains("sched: break things"));
        assert!(rendered.contains("[h1] fail"));
    }

    #[test]
    fn json_report_is_structured() {
        let (store, session) = seeded_store();
        let record = store.session(session).expect("read session");
        let rendered = render_json(&store, &record).expect("render");
        assert_eq!(rendered["session"]["status"], "completed");
        assert_eq!(rendered["iterations"][0]["verdict"], "bad");
        assert_eq!(rendered["iterations"][0]["hosts"][0]["host"], "h1");
    }
}
