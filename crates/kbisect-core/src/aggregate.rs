use crate::outcome::{HostOutcome, HostVerdict, IterationVerdict};

/// Reduce per-host outcomes to one commit verdict.
///
/// The policy is deliberately pessimistic: a regression affecting any
/// participating host is a regression, and a concrete failure outweighs an
/// inconclusive skip. Any unreachable host makes the iteration `Pending` —
/// the session must halt without marking the commit, because the lost host's
/// evidence is still outstanding.
pub fn aggregate_outcomes(outcomes: &[HostOutcome]) -> IterationVerdict {
    if outcomes.is_empty() {
        return IterationVerdict::Pending;
    }
    if outcomes
        .iter()
        .any(|outcome| outcome.verdict == HostVerdict::Unreachable)
    {
        return IterationVerdict::Pending;
    }
    if outcomes
        .iter()
        .any(|outcome| outcome.verdict == HostVerdict::Fail)
    {
        return IterationVerdict::Bad;
    }
    if outcomes
        .iter()
        .any(|outcome| outcome.verdict == HostVerdict::Skip)
    {
        return IterationVerdict::Skip;
    }
    IterationVerdict::Good
}

#[cfg(test)]
mod tests {
    use super::aggregate_outcomes;
    use crate::identifiers::HostId;
    use crate::outcome::{HostOutcome, HostVerdict, IterationVerdict, Phase};

    fn outcome(host: &str, verdict: HostVerdict) -> HostOutcome {
        let phase = match verdict {
            HostVerdict::Pass | HostVerdict::Fail => Phase::Done,
            HostVerdict::Skip => Phase::Build,
            HostVerdict::Unreachable => Phase::Boot,
        };
        HostOutcome::new(HostId::new(host), phase, verdict)
    }

    #[test]
    fn all_pass_is_good() {
        let outcomes = vec![
            outcome("srv", HostVerdict::Pass),
            outcome("cli", HostVerdict::Pass),
        ];
        assert_eq!(aggregate_outcomes(&outcomes), IterationVerdict::Good);
    }

    #[test]
    fn any_fail_is_bad() {
        let outcomes = vec![
            outcome("srv", HostVerdict::Pass),
            outcome("cli", HostVerdict::Fail),
        ];
        assert_eq!(aggregate_outcomes(&outcomes), IterationVerdict::Bad);
    }

    #[test]
    fn any_skip_without_fail_is_skip() {
        let outcomes = vec![
            outcome("srv", HostVerdict::Pass),
            outcome("cli", HostVerdict::Skip),
        ];
        assert_eq!(aggregate_outcomes(&outcomes), IterationVerdict::Skip);
    }

    #[test]
    fn fail_beats_skip() {
        let outcomes = vec![
            outcome("srv", HostVerdict::Skip),
            outcome("cli", HostVerdict::Fail),
        ];
        assert_eq!(aggregate_outcomes(&outcomes), IterationVerdict::Bad);
    }

    #[test]
    fn any_unreachable_is_pending_even_against_fail() {
        let outcomes = vec![
            outcome("srv", HostVerdict::Fail),
            outcome("cli", HostVerdict::Unreachable),
        ];
        assert_eq!(aggregate_outcomes(&outcomes), IterationVerdict::Pending);
    }

    #[test]
    fn no_outcomes_is_pending() {
        assert_eq!(aggregate_outcomes(&[]), IterationVerdict::Pending);
    }
}
