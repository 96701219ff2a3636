//! Mode-dependent gating between iterations.
//!
//! Pure policy: given the interaction mode and what the last iteration
//! produced, decide whether to continue, finish, or ask the remote human.

use super::protocol::Mode;
use genloop_core::{IterationOutcome, Recommendation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    AutoContinue,
    AutoComplete,
    AskUser,
}

/// Decides what happens after iteration `iteration` (zero-based).
///
/// Without a recommendation the gate keeps going until `max_iterations`
/// iterations have run and then completes.
pub fn decide(
    mode: Mode,
    outcome: &IterationOutcome,
    iteration: u32,
    max_iterations: u32,
) -> GateAction {
    match mode {
        Mode::Interactive => GateAction::AskUser,
        Mode::ConfirmFirst if iteration == 0 => GateAction::AskUser,
        Mode::ConfirmFirst | Mode::Autonomous => autonomous(outcome, iteration, max_iterations),
    }
}

fn autonomous(outcome: &IterationOutcome, iteration: u32, max_iterations: u32) -> GateAction {
    if budget_exhausted(iteration, max_iterations) {
        return GateAction::AutoComplete;
    }
    match outcome.recommendation {
        Some(Recommendation::Complete) => GateAction::AutoComplete,
        Some(Recommendation::Continue) | None => GateAction::AutoContinue,
    }
}

/// Whether iteration `iteration` is the last one the budget allows.
pub fn budget_exhausted(iteration: u32, max_iterations: u32) -> bool {
    iteration.saturating_add(1) >= max_iterations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ambiguous() -> IterationOutcome {
        IterationOutcome::success("built")
    }

    fn recommending(r: Recommendation) -> IterationOutcome {
        IterationOutcome::success("built").with_recommendation(r)
    }

    #[test]
    fn test_autonomous_never_asks() {
        for iteration in 0..20 {
            for outcome in [
                ambiguous(),
                recommending(Recommendation::Continue),
                recommending(Recommendation::Complete),
                IterationOutcome::failure("red"),
            ] {
                assert_ne!(
                    decide(Mode::Autonomous, &outcome, iteration, 10),
                    GateAction::AskUser
                );
            }
        }
    }

    #[test]
    fn test_autonomous_follows_recommendation() {
        assert_eq!(
            decide(Mode::Autonomous, &recommending(Recommendation::Complete), 0, 10),
            GateAction::AutoComplete
        );
        assert_eq!(
            decide(Mode::Autonomous, &recommending(Recommendation::Continue), 0, 10),
            GateAction::AutoContinue
        );
    }

    #[test]
    fn test_autonomous_default_continues_until_budget() {
        assert_eq!(decide(Mode::Autonomous, &ambiguous(), 8, 10), GateAction::AutoContinue);
        assert_eq!(decide(Mode::Autonomous, &ambiguous(), 9, 10), GateAction::AutoComplete);
        assert_eq!(
            decide(Mode::Autonomous, &recommending(Recommendation::Continue), 9, 10),
            GateAction::AutoComplete
        );
    }

    #[test]
    fn test_confirm_first_asks_only_on_first_iteration() {
        let outcome = recommending(Recommendation::Continue);
        assert_eq!(decide(Mode::ConfirmFirst, &outcome, 0, 10), GateAction::AskUser);
        assert_eq!(decide(Mode::ConfirmFirst, &outcome, 1, 10), GateAction::AutoContinue);
        assert_eq!(
            decide(Mode::ConfirmFirst, &recommending(Recommendation::Complete), 2, 10),
            GateAction::AutoComplete
        );
    }

    #[test]
    fn test_interactive_always_asks() {
        for outcome in [ambiguous(), recommending(Recommendation::Complete), IterationOutcome::failure("x")] {
            assert_eq!(decide(Mode::Interactive, &outcome, 5, 10), GateAction::AskUser);
            assert_eq!(decide(Mode::Interactive, &outcome, 9, 10), GateAction::AskUser);
        }
    }

    #[test]
    fn test_budget_exhausted() {
        assert!(!budget_exhausted(0, 2));
        assert!(budget_exhausted(1, 2));
        assert!(budget_exhausted(0, 1));
        assert!(budget_exhausted(u32::MAX, 3));
    }
}
