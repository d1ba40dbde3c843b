//! # Tool-Call Dispatcher
//!
//! The remote model drives the booking intake by calling four functions. Each
//! call is parsed into the closed [`ToolCall`] enum, resolved against the
//! session's [`RecordStore`], and answered with a JSON payload.
//!
//! ## Resolution rules:
//! - Every call gets exactly one response. Failures become `{"error": ...}`
//!   so the model can verbalize a fallback; nothing is thrown.
//! - `completeConsultation` yields the terminal [`ConsultationResult`] at most
//!   once per dispatcher. A repeated call is a protocol anomaly: it is still
//!   acknowledged but produces no second result.

use crate::error::ConsultationError;
use crate::live::protocol::FunctionCall;
use crate::records::{Doctor, Pet, RecordStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GET_MY_PETS: &str = "getMyPets";
pub const CHECK_AUTH_STATUS: &str = "checkAuthStatus";
pub const GET_DOCTORS: &str = "getDoctors";
pub const COMPLETE_CONSULTATION: &str = "completeConsultation";

/// Structured output of a finished consultation, handed to the booking flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationResult {
    pub pet_name: String,
    pub pet_type: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pet_breed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pet_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_doctor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_doctor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_time: Option<String>,
}

/// The fixed set of functions the model may call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    GetMyPets,
    CheckAuthStatus,
    GetDoctors { query: Option<String> },
    CompleteConsultation(ConsultationResult),
}

impl ToolCall {
    /// Parse a function call by name. Unknown names and missing required
    /// arguments are reported as tool resolution errors.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ConsultationError> {
        match name {
            GET_MY_PETS => Ok(ToolCall::GetMyPets),
            CHECK_AUTH_STATUS => Ok(ToolCall::CheckAuthStatus),
            GET_DOCTORS => {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ToolCall::GetDoctors { query })
            }
            COMPLETE_CONSULTATION => {
                // Some models send numbers for petAge; accept them as text.
                let mut args = if args.is_object() { args.clone() } else { json!({}) };
                if let Some(age) = args.get("petAge").filter(|v| v.is_number()).cloned() {
                    args["petAge"] = Value::String(age.to_string());
                }
                let result: ConsultationResult = serde_json::from_value(args).map_err(|e| {
                    ConsultationError::ToolResolution(format!(
                        "completeConsultation arguments are invalid: {}",
                        e
                    ))
                })?;
                Ok(ToolCall::CompleteConsultation(result))
            }
            other => Err(ConsultationError::ToolResolution(format!(
                "Unknown tool: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::GetMyPets => GET_MY_PETS,
            ToolCall::CheckAuthStatus => CHECK_AUTH_STATUS,
            ToolCall::GetDoctors { .. } => GET_DOCTORS,
            ToolCall::CompleteConsultation(_) => COMPLETE_CONSULTATION,
        }
    }
}

/// Function declarations sent in the session `setup` message.
pub fn tool_declarations() -> Value {
    json!([
        {
            "name": GET_MY_PETS,
            "description": "List the pets owned by the signed-in user.",
            "parameters": { "type": "OBJECT", "properties": {} }
        },
        {
            "name": CHECK_AUTH_STATUS,
            "description": "Check whether the user is signed in.",
            "parameters": { "type": "OBJECT", "properties": {} }
        },
        {
            "name": GET_DOCTORS,
            "description": "Find available doctors. Use \"any\" or leave the query empty to list everyone.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "query": {
                        "type": "STRING",
                        "description": "Part of the doctor's name, or \"any\"."
                    }
                }
            }
        },
        {
            "name": COMPLETE_CONSULTATION,
            "description": "Finish the consultation and hand the collected details to the booking form.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "petName": { "type": "STRING" },
                    "petType": { "type": "STRING", "description": "Species, e.g. dog or cat." },
                    "summary": { "type": "STRING", "description": "Short clinical summary of the problem." },
                    "petBreed": { "type": "STRING" },
                    "petAge": { "type": "STRING" },
                    "preferredDoctorId": { "type": "STRING" },
                    "preferredDoctorName": { "type": "STRING" },
                    "preferredDate": { "type": "STRING", "description": "YYYY-MM-DD" },
                    "preferredTime": { "type": "STRING", "description": "HH:MM" }
                },
                "required": ["petName", "petType", "summary"]
            }
        }
    ])
}

/// What resolving one call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Payload for the `toolResponse` keyed by the call's id.
    pub response: Value,
    /// Set only by the first successful `completeConsultation`.
    pub completion: Option<ConsultationResult>,
    /// Failure absorbed into `response`, surfaced for logging and metrics.
    pub error: Option<ConsultationError>,
}

impl ToolOutcome {
    fn ok(response: Value) -> Self {
        Self {
            response,
            completion: None,
            error: None,
        }
    }

    fn failed(error: ConsultationError) -> Self {
        let message = match &error {
            ConsultationError::ToolResolution(msg) | ConsultationError::ProtocolAnomaly(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        };
        Self {
            response: json!({ "error": message }),
            completion: None,
            error: Some(error),
        }
    }
}

/// Resolves one session's tool calls against its record store.
pub struct ToolDispatcher {
    records: Arc<dyn RecordStore>,
    completed: AtomicBool,
}

impl ToolDispatcher {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            completed: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub async fn dispatch(&self, call: &FunctionCall) -> ToolOutcome {
        let tool = match ToolCall::parse(&call.name, &call.args) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(call_id = %call.id, tool = %call.name, error = %e, "Rejected tool call");
                return ToolOutcome::failed(e);
            }
        };

        debug!(call_id = %call.id, tool = tool.name(), "Resolving tool call");

        let outcome = self.resolve(tool).await;
        if let Some(e) = &outcome.error {
            warn!(call_id = %call.id, tool = %call.name, error = %e, "Tool call failed");
        }
        outcome
    }

    async fn resolve(&self, tool: ToolCall) -> ToolOutcome {
        match tool {
            ToolCall::GetMyPets => match self.records.list_pets_for_current_actor().await {
                Ok(pets) => ToolOutcome::ok(json!({ "pets": pets_payload(&pets) })),
                Err(e) => ToolOutcome::failed(ConsultationError::ToolResolution(e.to_string())),
            },

            ToolCall::CheckAuthStatus => {
                let actor = match self.records.current_actor().await {
                    Ok(actor) => actor,
                    Err(e) => {
                        // Absence of a user is never an error for this tool.
                        warn!(error = %e, "Auth lookup failed, reporting anonymous");
                        None
                    }
                };
                match actor {
                    Some(actor) => ToolOutcome::ok(json!({
                        "isAuthenticated": true,
                        "userId": actor.id,
                    })),
                    None => ToolOutcome::ok(json!({ "isAuthenticated": false })),
                }
            }

            ToolCall::GetDoctors { query } => {
                let query = normalize_doctor_query(query.as_deref());
                match self.records.search_available_doctors(query).await {
                    Ok(doctors) => ToolOutcome::ok(json!({ "doctors": doctors_payload(&doctors) })),
                    Err(e) => ToolOutcome::failed(ConsultationError::ToolResolution(e.to_string())),
                }
            }

            ToolCall::CompleteConsultation(result) => {
                if self.completed.swap(true, Ordering::SeqCst) {
                    let anomaly = ConsultationError::ProtocolAnomaly(
                        "completeConsultation called after the consultation completed".to_string(),
                    );
                    warn!(error = %anomaly, "Ignoring duplicate completion");
                    return ToolOutcome {
                        response: json!({ "success": true, "alreadyCompleted": true }),
                        completion: None,
                        error: Some(anomaly),
                    };
                }

                info!(pet_name = %result.pet_name, pet_type = %result.pet_type, "Consultation completed");
                ToolOutcome {
                    response: json!({ "success": true }),
                    completion: Some(result),
                    error: None,
                }
            }
        }
    }
}

/// `"any"` (any case) and blank queries mean "no filter".
fn normalize_doctor_query(query: Option<&str>) -> &str {
    match query.map(str::trim) {
        Some(q) if !q.is_empty() && !q.eq_ignore_ascii_case("any") => q,
        _ => "",
    }
}

fn pets_payload(pets: &[Pet]) -> Vec<Value> {
    pets.iter()
        .map(|pet| {
            json!({
                "id": pet.id,
                "name": pet.name,
                "type": pet.species,
                "breed": pet.breed,
                "age": pet.age,
            })
        })
        .collect()
}

fn doctors_payload(doctors: &[Doctor]) -> Vec<Value> {
    doctors
        .iter()
        .map(|doctor| {
            json!({
                "id": doctor.id,
                "name": doctor.name,
                "specialization": doctor.specialization,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tests::records;
    use crate::records::{Actor, RecordError};
    use async_trait::async_trait;

    fn call(name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: format!("call-{}", name),
            name: name.to_string(),
            args,
        }
    }

    fn dispatcher(actor: Option<&str>) -> ToolDispatcher {
        ToolDispatcher::new(Arc::new(records().for_actor(actor.map(str::to_string))))
    }

    fn doctor_names(outcome: &ToolOutcome) -> Vec<String> {
        outcome.response["doctors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_get_doctors_any_and_empty_are_unfiltered() {
        let dispatcher = dispatcher(None);
        let empty = dispatcher.dispatch(&call(GET_DOCTORS, json!({ "query": "" }))).await;
        let any = dispatcher.dispatch(&call(GET_DOCTORS, json!({ "query": "ANY" }))).await;
        let missing = dispatcher.dispatch(&call(GET_DOCTORS, json!({}))).await;

        assert_eq!(doctor_names(&empty).len(), 5);
        assert_eq!(doctor_names(&empty), doctor_names(&any));
        assert_eq!(doctor_names(&empty), doctor_names(&missing));
    }

    #[tokio::test]
    async fn test_get_doctors_substring_match() {
        let dispatcher = dispatcher(None);
        let outcome = dispatcher
            .dispatch(&call(GET_DOCTORS, json!({ "query": "smith" })))
            .await;
        assert_eq!(
            doctor_names(&outcome),
            vec!["Dr. Amelia Smith", "Dr. Carla Smithers"]
        );
    }

    #[tokio::test]
    async fn test_get_my_pets_without_actor_returns_error_payload() {
        let dispatcher = dispatcher(None);
        let outcome = dispatcher.dispatch(&call(GET_MY_PETS, json!({}))).await;
        assert!(outcome.response["error"].is_string());
        assert!(matches!(outcome.error, Some(ConsultationError::ToolResolution(_))));
        assert!(outcome.completion.is_none());
    }

    #[tokio::test]
    async fn test_get_my_pets_for_actor() {
        let dispatcher = dispatcher(Some("user-1"));
        let outcome = dispatcher.dispatch(&call(GET_MY_PETS, json!({}))).await;
        let pets = outcome.response["pets"].as_array().unwrap();
        assert_eq!(pets.len(), 2);
        assert_eq!(pets[0]["name"], "Max");
        assert_eq!(pets[0]["type"], "dog");
    }

    #[tokio::test]
    async fn test_check_auth_status() {
        let anonymous = dispatcher(None)
            .dispatch(&call(CHECK_AUTH_STATUS, Value::Null))
            .await;
        assert_eq!(anonymous.response, json!({ "isAuthenticated": false }));

        let signed_in = dispatcher(Some("user-2"))
            .dispatch(&call(CHECK_AUTH_STATUS, Value::Null))
            .await;
        assert_eq!(
            signed_in.response,
            json!({ "isAuthenticated": true, "userId": "user-2" })
        );
    }

    #[tokio::test]
    async fn test_complete_with_required_fields_only() {
        let dispatcher = dispatcher(None);
        let outcome = dispatcher
            .dispatch(&call(
                COMPLETE_CONSULTATION,
                json!({ "summary": "Vomiting since yesterday", "petName": "Max", "petType": "dog" }),
            ))
            .await;

        let result = outcome.completion.unwrap();
        assert_eq!(result.pet_name, "Max");
        assert_eq!(result.pet_breed, None);
        assert_eq!(result.pet_age, None);
        assert_eq!(result.preferred_doctor_id, None);
        assert_eq!(result.preferred_doctor_name, None);
        assert_eq!(result.preferred_date, None);
        assert_eq!(result.preferred_time, None);
        assert_eq!(outcome.response, json!({ "success": true }));

        let serialized = serde_json::to_value(&result).unwrap();
        assert!(serialized.get("petBreed").is_none());
    }

    #[tokio::test]
    async fn test_complete_missing_required_field_is_answered_with_error() {
        let dispatcher = dispatcher(None);
        let outcome = dispatcher
            .dispatch(&call(COMPLETE_CONSULTATION, json!({ "petName": "Max" })))
            .await;
        assert!(outcome.completion.is_none());
        assert!(outcome.response["error"].is_string());
        assert!(!dispatcher.is_completed());
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_acknowledged_once() {
        let dispatcher = dispatcher(None);
        let args = json!({ "summary": "Limping", "petName": "Luna", "petType": "cat", "petAge": 4 });

        let first = dispatcher.dispatch(&call(COMPLETE_CONSULTATION, args.clone())).await;
        assert_eq!(first.completion.unwrap().pet_age.as_deref(), Some("4"));

        let second = dispatcher.dispatch(&call(COMPLETE_CONSULTATION, args)).await;
        assert!(second.completion.is_none());
        assert_eq!(second.response["success"], true);
        assert!(matches!(second.error, Some(ConsultationError::ProtocolAnomaly(_))));
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_error_response() {
        let outcome = dispatcher(None)
            .dispatch(&call("cancelAppointment", json!({})))
            .await;
        assert_eq!(outcome.response, json!({ "error": "Unknown tool: cancelAppointment" }));
    }

    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        async fn list_pets_for_current_actor(&self) -> Result<Vec<Pet>, RecordError> {
            Err(RecordError::Unavailable("timeout".into()))
        }
        async fn current_actor(&self) -> Result<Option<Actor>, RecordError> {
            Err(RecordError::Unavailable("timeout".into()))
        }
        async fn search_available_doctors(&self, _query: &str) -> Result<Vec<Doctor>, RecordError> {
            Err(RecordError::Unavailable("timeout".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failures_never_escape() {
        let dispatcher = ToolDispatcher::new(Arc::new(BrokenStore));
        let doctors = dispatcher.dispatch(&call(GET_DOCTORS, json!({}))).await;
        assert!(doctors.response["error"].as_str().unwrap().contains("timeout"));

        let auth = dispatcher.dispatch(&call(CHECK_AUTH_STATUS, json!({}))).await;
        assert_eq!(auth.response, json!({ "isAuthenticated": false }));
    }

    #[test]
    fn test_declarations_cover_every_tool() {
        let declarations = tool_declarations();
        let names: Vec<&str> = declarations
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![GET_MY_PETS, CHECK_AUTH_STATUS, GET_DOCTORS, COMPLETE_CONSULTATION]
        );
        assert_eq!(
            declarations[3]["parameters"]["required"],
            json!(["petName", "petType", "summary"])
        );
    }
}
