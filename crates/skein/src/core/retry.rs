/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch the same record again, leaving `remaining` retries.
    Retry { remaining: u32 },
    GiveUp,
}

/// Decide what to do after a failed attempt.
///
/// # Examples
///
/// ```
/// use skein::{RetryDecision, decide_retry};
///
/// assert_eq!(decide_retry(2, false), RetryDecision::Retry { remaining: 1 });
/// assert_eq!(decide_retry(0, false), RetryDecision::GiveUp);
/// assert_eq!(decide_retry(5, true), RetryDecision::GiveUp);
/// ```
pub fn decide_retry(budget: u32, cancelled: bool) -> RetryDecision {
    if cancelled || budget == 0 {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry { remaining: budget - 1 }
}
