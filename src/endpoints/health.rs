/// Liveness probe. Touches nothing behind the gate.
pub async fn health() -> &'static str {
  "ok"
}
