use crate::signal::SimObject;
use crate::value::Val;
use crate::TaskResult;

/// Wait for `n_cycles` rising edges of `signal`. Resolves with the simulation
/// time of the last edge.
pub async fn clock_cycles(signal: &SimObject, n_cycles: u32) -> TaskResult {
    for _ in 0..n_cycles {
        signal.rising_edge().await;
    }
    Ok(Val::Int(signal.sim().now() as i64))
}
