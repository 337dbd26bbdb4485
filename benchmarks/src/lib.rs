//! Benchmark-only member; see `benches/`.
