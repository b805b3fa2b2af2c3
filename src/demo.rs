//! Scripted support conversation: the golden path followed by a warranty
//! correction.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::json;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Generator;
use stepwise_core::types::{Generation, GenerationRequest};

pub const MESSAGES: [&str; 5] = [
    "Hi, my phone screen is cracked",
    "Yes, it's still under warranty",
    "The screen is physically cracked from dropping it",
    "What should I do?",
    "Actually, I made a mistake - my device is out of warranty",
];

/// Canned replies for `stepwise demo --offline`, one per scripted message.
pub struct CannedGenerator {
    script: Mutex<VecDeque<Generation>>,
}

impl CannedGenerator {
    pub fn new() -> Self {
        let script = vec![
            Generation::reply(
                "I'm sorry to hear about your screen! Is your phone still under warranty?",
            ),
            Generation::reply("Thanks for confirming. Can you describe what happened to the screen?")
                .with_action("record_warranty_status", json!({"status": "in_warranty"})),
            Generation::reply("That sounds like physical damage, so I'll treat it as a hardware issue.")
                .with_action("record_issue_type", json!({"issue_type": "hardware"})),
            Generation::reply(
                "Since your phone is under warranty, you can get the screen replaced for free. \
                 Book a repair at an authorized service center and bring your proof of purchase.",
            )
            .with_action(
                "provide_solution",
                json!({"solution": "Warranty screen replacement at an authorized service center"}),
            ),
            Generation::reply("No problem, let's correct that. Is the device out of warranty?")
                .with_action(
                    "go_back_to_warranty",
                    json!({"reason": "customer corrected warranty status"}),
                ),
        ];
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

impl Generator for CannedGenerator {
    fn generate(&self, _request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        let next = self
            .script
            .lock()
            .map_err(|e| StepwiseError::Generation(e.to_string()))
            .and_then(|mut script| {
                script
                    .pop_front()
                    .ok_or_else(|| StepwiseError::Generation("demo script finished".into()))
            });
        Box::pin(async move { next })
    }
}
