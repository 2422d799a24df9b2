//! Verifier Module: post-execution verification of task outcomes.
//!
//! Runs a three-stage pipeline (self-check, evidence, smart review) over the
//! final page state and produces a [`VerificationResult`] with per-stage
//! scores and correction hints for the next attempt.
//!
//! # Usage
//!
//! ```rust,ignore
//! use task_engine::verifier::{VerificationInput, VerificationPipeline};
//!
//! let pipeline = VerificationPipeline::new(config, resilience).with_judge(judge);
//! let result = pipeline.verify(input, Some(driver.as_ref())).await;
//! println!("passed={} confidence={:.0}", result.passed, result.confidence);
//! ```

pub mod pipeline;
pub mod profile;

pub use pipeline::{
    composite_score, parse_judge_reply, score_snapshot, JudgeVerdict, Snapshot, StageScore, VerificationInput,
    VerificationMethod, VerificationPipeline, VerificationResult, JUDGE_RESOURCE,
};
pub use profile::{profile_for, QualityTier, TaskProfile, TierTarget};
