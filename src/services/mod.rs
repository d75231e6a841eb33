pub mod azure_openai;
pub mod bedrock;
pub mod extraction;
pub mod inference;
pub mod ingestion;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod validation;
