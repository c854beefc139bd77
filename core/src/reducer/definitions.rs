//! Built-in FSM tables

use super::{FsmDefinition, FsmType, IntentTemplate};
use crate::error::Result;
use crate::intent::{IntentType, Priority};

const STATE_STORE: &str = "state_store";
const CACHE: &str = "cache";
const PRODUCER: &str = "message_producer";
const VECTOR_STORE: &str = "vector_store";
const OBSERVER: &str = "host";

fn state_update() -> IntentTemplate {
    IntentTemplate::new(IntentType::StateUpdate, STATE_STORE).priority(Priority::High)
}

fn publish() -> IntentTemplate {
    IntentTemplate::new(IntentType::EventPublish, PRODUCER)
}

fn log() -> IntentTemplate {
    IntentTemplate::new(IntentType::Log, OBSERVER).priority(Priority::Low)
}

fn metric() -> IntentTemplate {
    IntentTemplate::new(IntentType::Metric, OBSERVER).priority(Priority::Low)
}

pub fn builtin() -> Result<Vec<FsmDefinition>> {
    Ok(vec![ingestion()?, quality_assessment()?, pattern_learning()?])
}

pub fn ingestion() -> Result<FsmDefinition> {
    FsmDefinition::builder(FsmType::Ingestion)
        .initial("RECEIVED")
        .state("PARSED")
        .state("EMBEDDED")
        .terminal("COMPLETED")
        .terminal("FAILED")
        .transition(
            "RECEIVED",
            "PARSE_COMPLETED",
            "PARSED",
            vec![
                state_update(),
                IntentTemplate::new(IntentType::WorkflowTrigger, "ingestion_orchestrator"),
            ],
        )
        .transition(
            "PARSED",
            "EMBEDDING_COMPLETED",
            "EMBEDDED",
            vec![state_update(), IntentTemplate::new(IntentType::CacheWrite, CACHE).ttl_ms(300_000)],
        )
        .transition(
            "EMBEDDED",
            "INDEXING_COMPLETED",
            "COMPLETED",
            vec![state_update(), publish(), metric()],
        )
        .transition("*", "PROCESSING_FAILED", "FAILED", vec![state_update(), publish(), log()])
        .build()
}

pub fn quality_assessment() -> Result<FsmDefinition> {
    FsmDefinition::builder(FsmType::QualityAssessment)
        .initial("PENDING")
        .state("SCORING")
        .state("SCORED")
        .terminal("ACCEPTED")
        .terminal("REJECTED")
        .terminal("FAILED")
        .transition(
            "PENDING",
            "ASSESSMENT_STARTED",
            "SCORING",
            vec![state_update(), IntentTemplate::new(IntentType::DataFetch, VECTOR_STORE)],
        )
        .transition(
            "SCORING",
            "SCORE_COMPUTED",
            "SCORED",
            vec![state_update(), IntentTemplate::new(IntentType::CacheWrite, CACHE)],
        )
        .transition("SCORED", "SCORE_ACCEPTED", "ACCEPTED", vec![state_update(), publish()])
        .transition("SCORED", "SCORE_REJECTED", "REJECTED", vec![state_update(), publish(), log()])
        .transition("*", "ASSESSMENT_FAILED", "FAILED", vec![state_update(), log()])
        .build()
}

pub fn pattern_learning() -> Result<FsmDefinition> {
    FsmDefinition::builder(FsmType::PatternLearning)
        .initial("IDLE")
        .state("COLLECTING")
        .state("TRAINING")
        .terminal("LEARNED")
        .terminal("FAILED")
        .transition(
            "IDLE",
            "SAMPLES_REQUESTED",
            "COLLECTING",
            vec![state_update(), IntentTemplate::new(IntentType::DataFetch, VECTOR_STORE)],
        )
        .transition(
            "COLLECTING",
            "SAMPLES_COLLECTED",
            "TRAINING",
            vec![
                state_update(),
                IntentTemplate::new(IntentType::WorkflowTrigger, "pattern_learning_orchestrator"),
            ],
        )
        .transition(
            "TRAINING",
            "TRAINING_COMPLETED",
            "LEARNED",
            vec![state_update(), IntentTemplate::new(IntentType::CacheWrite, CACHE), metric()],
        )
        .transition("*", "LEARNING_FAILED", "FAILED", vec![state_update(), log()])
        .build()
}
