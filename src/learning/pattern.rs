//! Pattern synthesis from high-quality trajectories, and the pattern-created hook.

use chrono::Utc;

use super::types::{Pattern, RlmContext, Trajectory};

/// Dimensions of the hashed pattern embedding.
pub const PATTERN_EMBEDDING_DIM: usize = 64;
/// Longest step sequence kept on a pattern.
pub const MAX_PATTERN_STEPS: usize = 32;

/// Receives a notification for every minted pattern (e.g. an external pattern index).
///
/// Fire-and-forget: errors are logged by the engine and never fail the feedback call.
pub trait PatternSink: Send + Sync {
    fn pattern_created(&self, pattern: &Pattern) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPatternSink;

impl PatternSink for NoopPatternSink {
    fn pattern_created(&self, _pattern: &Pattern) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Build a pattern from a scored trajectory.
pub fn synthesize(trajectory: &Trajectory, quality: f64, context: Option<&RlmContext>) -> Pattern {
    let steps = compress_steps(trajectory);
    let embedding = embed(&trajectory.route, &steps);
    Pattern {
        id: format!("pat-{}", uuid::Uuid::now_v7().simple()),
        route: trajectory.route.clone(),
        source_trajectory: trajectory.id.clone(),
        embedding,
        quality,
        description: describe(&trajectory.route, &steps, quality, context),
        steps,
        created_at: Utc::now(),
        usage_count: 0,
    }
}

/// Patterns then context, consecutive duplicates collapsed, capped at [`MAX_PATTERN_STEPS`].
fn compress_steps(trajectory: &Trajectory) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();
    let all = trajectory
        .pattern_ids
        .iter()
        .chain(trajectory.context_ids.iter());
    for step in all {
        if steps.last() != Some(step) {
            steps.push(step.clone());
        }
        if steps.len() == MAX_PATTERN_STEPS {
            break;
        }
    }
    steps
}

/// Feature-hashed bag of the route and steps, L2-normalized. Later steps weigh less.
fn embed(route: &str, steps: &[String]) -> Vec<f32> {
    let mut embedding = vec![0.0f32; PATTERN_EMBEDDING_DIM];
    accumulate(&mut embedding, route, 1.0);
    for (i, step) in steps.iter().enumerate() {
        accumulate(&mut embedding, step, 1.0 / (1.0 + i as f32));
    }

    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for e in &mut embedding {
            *e /= norm;
        }
    }
    embedding
}

fn accumulate(embedding: &mut [f32], token: &str, weight: f32) {
    let hash = fnv1a(token.as_bytes());
    let slot = (hash % PATTERN_EMBEDDING_DIM as u64) as usize;
    let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
    embedding[slot] += sign * weight;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn describe(route: &str, steps: &[String], quality: f64, context: Option<&RlmContext>) -> String {
    let flow = if steps.is_empty() {
        "(no steps)".to_string()
    } else {
        steps.join(" → ")
    };
    let mut description = format!("{route}: {flow} (quality {quality:.2})");
    if let Some(agent) = context.and_then(|c| c.agent_key.as_deref()) {
        description.push_str(&format!(" via {agent}"));
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trajectory(patterns: &[&str], context: &[&str]) -> Trajectory {
        Trajectory::new(
            "coding.review",
            patterns.iter().map(|s| s.to_string()).collect(),
            context.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn steps_collapse_consecutive_duplicates() {
        let t = trajectory(&["p1", "p2"], &["p2", "ctx", "ctx"]);
        let pattern = synthesize(&t, 0.9, None);
        assert_eq!(pattern.steps, vec!["p1", "p2", "ctx"]);
        assert_eq!(pattern.source_trajectory, t.id);
        assert_eq!(pattern.usage_count, 0);
    }

    #[test]
    fn embedding_is_normalized_and_deterministic() {
        let t = trajectory(&["p1", "p2"], &[]);
        let a = synthesize(&t, 0.9, None);
        let b = synthesize(&t, 0.9, None);
        assert_eq!(a.embedding, b.embedding);
        assert_ne!(a.id, b.id);
        let norm: f32 = a.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn description_mentions_route_and_agent() {
        let t = trajectory(&["p1"], &[]);
        let context = RlmContext {
            agent_key: Some("reviewer".into()),
            ..Default::default()
        };
        let pattern = synthesize(&t, 0.85, Some(&context));
        assert_eq!(pattern.description, "coding.review: p1 (quality 0.85) via reviewer");
    }

    #[test]
    fn steps_are_capped() {
        let ids: Vec<String> = (0..50).map(|i| format!("p{i}")).collect();
        let t = Trajectory::new("r", ids, vec![]);
        assert_eq!(synthesize(&t, 1.0, None).steps.len(), MAX_PATTERN_STEPS);
    }
}
