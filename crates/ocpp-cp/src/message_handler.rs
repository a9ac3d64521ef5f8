//! # Protocol State Machine
//!
//! Inbound Calls are dispatched by action to a handler that produces the CallResult payload
//! and, for some actions, a [`FollowUp`] the session runs once the CallResult is on the
//! wire. CallResults are dispatched by the action of the call they answer.

use crate::error::{ChargePointError, ChargePointResult};
use crate::session::Session;
use crate::transaction::wire_meter_value;
use crate::SessionEvent;
use chrono::Utc;
use ocpp_messages::v16j::*;
use ocpp_messages::{CallErrorMessage, CallMessage, OcppAction};
use ocpp_types::common::Reason;
use ocpp_types::v16j::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between acknowledging a Reset and closing the connection.
pub const RESET_GRACE: Duration = Duration::from_secs(3);
/// Simulated diagnostics upload time.
pub const DIAGNOSTICS_UPLOAD_DELAY: Duration = Duration::from_secs(5);
pub const DIAGNOSTICS_FILE_NAME: &str = "file.tar.gz";

/// Work that must start only after the CallResult for the triggering Call was sent.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    /// StartTransaction, then a Charging StatusNotification.
    RemoteStart { connector_id: u32, id_tag: String },
    /// StopTransaction with the computed meter value, then Finishing.
    RemoteStop { transaction_id: i32 },
    /// Uploading, a pause, then Uploaded.
    DiagnosticsUpload,
    /// Close the connection after [`RESET_GRACE`].
    Reset { reset_type: ResetType },
}

/// What a Call handler answers with.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerReply {
    pub payload: Value,
    pub follow_up: Option<FollowUp>,
}

impl HandlerReply {
    pub fn new<T: OcppAction>(response: T) -> ChargePointResult<Self> {
        Ok(Self {
            payload: serde_json::to_value(response)?,
            follow_up: None,
        })
    }

    pub fn then(mut self, follow_up: FollowUp) -> Self {
        self.follow_up = Some(follow_up);
        self
    }
}

fn decode<T: DeserializeOwned>(action: &str, payload: &Value) -> ChargePointResult<T> {
    T::deserialize(payload).map_err(|e| ChargePointError::schema_violation(action, e.to_string()))
}

/// Handles a Call from the central system.
///
/// Unknown actions are an [`ChargePointError::UnimplementedAction`], which the session
/// answers with a `NotImplemented` CallError.
pub async fn handle_call(session: &Session, call: &CallMessage) -> ChargePointResult<HandlerReply> {
    let charge_point_id = session.charge_point_id();
    let action = call.action.as_str();

    match action {
        "ClearCache" => HandlerReply::new(ClearCacheResponse {
            status: ClearCacheStatus::Accepted,
        }),
        "ChangeConfiguration" => {
            let request: ChangeConfigurationRequest = decode(action, &call.payload)?;
            let status = if session
                .update_configuration(&request.key, &request.value)
                .await
            {
                ConfigurationStatus::Accepted
            } else {
                ConfigurationStatus::Rejected
            };
            info!(
                charge_point_id,
                "ChangeConfiguration {}={} -> {:?}", request.key, request.value, status
            );
            HandlerReply::new(ChangeConfigurationResponse { status })
        }
        "GetConfiguration" => {
            let request: GetConfigurationRequest = decode(action, &call.payload)?;
            let response = session.configuration(request.key.as_deref()).await;
            debug!(
                charge_point_id,
                "GetConfiguration: {} keys, {} unknown",
                response.configuration_key.len(),
                response.unknown_key.len()
            );
            HandlerReply::new(response)
        }
        "Reset" => {
            let request: ResetRequest = decode(action, &call.payload)?;
            info!(charge_point_id, "Reset ({:?}) requested", request.reset_type);
            Ok(HandlerReply::new(ResetResponse {
                status: ResetStatus::Accepted,
            })?
            .then(FollowUp::Reset {
                reset_type: request.reset_type,
            }))
        }
        "SetChargingProfile" => {
            decode::<SetChargingProfileRequest>(action, &call.payload)?;
            HandlerReply::new(SetChargingProfileResponse {
                status: ChargingProfileStatus::Accepted,
            })
        }
        "ClearChargingProfile" => HandlerReply::new(ClearChargingProfileResponse {
            status: ClearChargingProfileStatus::Accepted,
        }),
        "RemoteStartTransaction" => {
            let request: RemoteStartTransactionRequest = decode(action, &call.payload)?;
            match request.connector_id {
                Some(connector_id) if connector_id > 0 => {
                    info!(
                        charge_point_id,
                        "Remote start on connector {} for {}", connector_id, request.id_tag
                    );
                    Ok(HandlerReply::new(RemoteStartTransactionResponse {
                        status: RemoteStartStopStatus::Accepted,
                    })?
                    .then(FollowUp::RemoteStart {
                        connector_id,
                        id_tag: request.id_tag,
                    }))
                }
                _ => {
                    warn!(charge_point_id, "Remote start without a connector, rejecting");
                    HandlerReply::new(RemoteStartTransactionResponse {
                        status: RemoteStartStopStatus::Rejected,
                    })
                }
            }
        }
        "RemoteStopTransaction" => {
            let request: RemoteStopTransactionRequest = decode(action, &call.payload)?;
            if session.transactions().contains(request.transaction_id) {
                info!(charge_point_id, "Remote stop of transaction {}", request.transaction_id);
                Ok(HandlerReply::new(RemoteStopTransactionResponse {
                    status: RemoteStartStopStatus::Accepted,
                })?
                .then(FollowUp::RemoteStop {
                    transaction_id: request.transaction_id,
                }))
            } else {
                warn!(
                    charge_point_id,
                    "Remote stop of unknown transaction {}", request.transaction_id
                );
                HandlerReply::new(RemoteStopTransactionResponse {
                    status: RemoteStartStopStatus::Rejected,
                })
            }
        }
        "ReserveNow" => {
            decode::<ReserveNowRequest>(action, &call.payload)?;
            HandlerReply::new(ReserveNowResponse {
                status: ReservationStatus::Accepted,
            })
        }
        "CancelReservation" => HandlerReply::new(CancelReservationResponse {
            status: CancelReservationStatus::Accepted,
        }),
        "UnlockConnector" => HandlerReply::new(UnlockConnectorResponse {
            status: UnlockStatus::Unlocked,
        }),
        "TriggerMessage" => {
            let request: TriggerMessageRequest = decode(action, &call.payload)?;
            let status = match request.requested_message {
                MessageTrigger::StatusNotification => TriggerMessageStatus::Accepted,
                _ => TriggerMessageStatus::NotImplemented,
            };
            HandlerReply::new(TriggerMessageResponse { status })
        }
        "ChangeAvailability" => HandlerReply::new(ChangeAvailabilityResponse {
            status: AvailabilityStatus::Accepted,
        }),
        "DataTransfer" => HandlerReply::new(DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: None,
        }),
        "GetDiagnostics" => Ok(HandlerReply::new(GetDiagnosticsResponse {
            file_name: Some(DIAGNOSTICS_FILE_NAME.to_string()),
        })?
        .then(FollowUp::DiagnosticsUpload)),
        other => Err(ChargePointError::unimplemented(other)),
    }
}

/// Applies the effects of a CallResult, keyed by the action of the originating call.
pub async fn handle_call_result(
    session: &Arc<Session>,
    action: &str,
    request: &Value,
    response: &Value,
) -> ChargePointResult<()> {
    let charge_point_id = session.charge_point_id();

    match action {
        "BootNotification" => {
            let response: BootNotificationResponse = decode(action, response)?;
            info!(
                charge_point_id,
                "BootNotification {:?}, heartbeat every {}s", response.status, response.interval
            );
            session.start_heartbeat(response.interval).await;
            session.emit(SessionEvent::Booted {
                charge_point_id: charge_point_id.to_string(),
                status: response.status,
                interval: response.interval,
            });
        }
        "StartTransaction" => {
            let request: StartTransactionRequest = decode(action, request)?;
            let response: StartTransactionResponse = decode(action, response)?;
            session.transactions().start_transaction(
                response.transaction_id,
                request.connector_id,
                session.meter_values_sink(),
            );
        }
        "StopTransaction" => {
            let request: StopTransactionRequest = decode(action, request)?;
            session.transactions().stop_transaction(request.transaction_id);
        }
        "MeterValues"
        | "Heartbeat"
        | "StatusNotification"
        | "Authorize"
        | "DataTransfer"
        | "DiagnosticsStatusNotification"
        | "SecurityEventNotification" => {}
        other => return Err(ChargePointError::unimplemented(other)),
    }
    Ok(())
}

/// CallErrors are only logged; the waiting caller receives the error itself.
pub fn handle_call_error(session: &Session, action: &str, error: &CallErrorMessage) {
    warn!(
        charge_point_id = session.charge_point_id(),
        "{} [{}] failed: {} {}",
        action,
        error.unique_id,
        error.error_code,
        error.error_description
    );
}

/// Runs `follow_up` in the background.
pub fn spawn_follow_up(session: &Arc<Session>, follow_up: FollowUp) -> JoinHandle<()> {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let description = format!("{:?}", follow_up);
        if let Err(e) = run_follow_up(&session, follow_up).await {
            warn!(
                charge_point_id = session.charge_point_id(),
                "{} did not complete: {}", description, e
            );
        }
    })
}

async fn run_follow_up(session: &Arc<Session>, follow_up: FollowUp) -> ChargePointResult<()> {
    match follow_up {
        FollowUp::RemoteStart {
            connector_id,
            id_tag,
        } => {
            let meter_start = session.transactions().start_meter_value(connector_id);
            session
                .call_action(StartTransactionRequest {
                    connector_id,
                    id_tag,
                    meter_start: wire_meter_value(meter_start),
                    reservation_id: None,
                    timestamp: Utc::now(),
                })
                .await?;
            session
                .call_action(StatusNotificationRequest::new(
                    connector_id,
                    ChargePointStatus::Charging,
                ))
                .await?;
        }
        FollowUp::RemoteStop { transaction_id } => {
            let connector_id = session.transactions().connector_of(transaction_id);
            let meter_stop = session.transactions().get_meter_value(transaction_id);
            session
                .call_action(StopTransactionRequest {
                    id_tag: None,
                    meter_stop: wire_meter_value(meter_stop),
                    timestamp: Utc::now(),
                    transaction_id,
                    reason: Some(Reason::Remote),
                    transaction_data: None,
                })
                .await?;
            if let Some(connector_id) = connector_id {
                session
                    .call_action(StatusNotificationRequest::new(
                        connector_id,
                        ChargePointStatus::Finishing,
                    ))
                    .await?;
            }
        }
        FollowUp::DiagnosticsUpload => {
            session
                .call_action(DiagnosticsStatusNotificationRequest {
                    status: DiagnosticsStatus::Uploading,
                })
                .await?;
            tokio::time::sleep(DIAGNOSTICS_UPLOAD_DELAY).await;
            session
                .call_action(DiagnosticsStatusNotificationRequest {
                    status: DiagnosticsStatus::Uploaded,
                })
                .await?;
        }
        FollowUp::Reset { reset_type } => {
            tokio::time::sleep(RESET_GRACE).await;
            session.emit(SessionEvent::ResetRequested {
                charge_point_id: session.charge_point_id().to_string(),
                reset_type,
            });
            session.close("Reset").await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionConfig;
    use ocpp_transport::LoopbackConnector;
    use serde_json::json;

    fn session(model: &str) -> Arc<Session> {
        let (connector, _peers) = LoopbackConnector::new();
        let config = SessionConfig {
            model: model.to_string(),
            ..SessionConfig::default()
        };
        Session::new(config, Arc::new(connector)).unwrap()
    }

    fn call(action: &str, payload: Value) -> CallMessage {
        CallMessage {
            unique_id: "cs-1".to_string(),
            action: action.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_change_configuration_respects_readonly() {
        let session = session("EVC01");

        let reply = handle_call(
            &session,
            &call(
                "ChangeConfiguration",
                json!({"key": "NumberOfConnectors", "value": "4"}),
            ),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"status": "Rejected"}));

        let reply = handle_call(
            &session,
            &call(
                "ChangeConfiguration",
                json!({"key": "HeartbeatInterval", "value": "60"}),
            ),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"status": "Accepted"}));
        assert!(reply.follow_up.is_none());

        let reply = handle_call(
            &session,
            &call("GetConfiguration", json!({"key": ["HeartbeatInterval", "Bogus"]})),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload["configurationKey"][0]["key"], "HeartbeatInterval");
        assert_eq!(reply.payload["configurationKey"][0]["value"], "60");
        assert_eq!(reply.payload["unknownKey"], json!(["Bogus"]));
    }

    #[tokio::test]
    async fn test_unknown_configuration_key_rejected() {
        let session = session("EVC01");
        let reply = handle_call(
            &session,
            &call("ChangeConfiguration", json!({"key": "NoSuchKey", "value": "1"})),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"status": "Rejected"}));
    }

    #[tokio::test]
    async fn test_remote_start_requires_connector() {
        let session = session("EVC01");

        let reply = handle_call(
            &session,
            &call("RemoteStartTransaction", json!({"idTag": "TAG"})),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"status": "Rejected"}));
        assert!(reply.follow_up.is_none());

        let reply = handle_call(
            &session,
            &call(
                "RemoteStartTransaction",
                json!({"connectorId": 1, "idTag": "TAG"}),
            ),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"status": "Accepted"}));
        assert_eq!(
            reply.follow_up,
            Some(FollowUp::RemoteStart {
                connector_id: 1,
                id_tag: "TAG".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_remote_stop_unknown_transaction() {
        let session = session("EVC01");
        let reply = handle_call(
            &session,
            &call("RemoteStopTransaction", json!({"transactionId": 404})),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"status": "Rejected"}));
    }

    #[tokio::test]
    async fn test_fixed_answers() {
        let session = session("EVC01");
        let cases = [
            ("ClearCache", json!({}), json!({"status": "Accepted"})),
            ("UnlockConnector", json!({"connectorId": 1}), json!({"status": "Unlocked"})),
            (
                "ChangeAvailability",
                json!({"connectorId": 0, "type": "Inoperative"}),
                json!({"status": "Accepted"}),
            ),
            (
                "TriggerMessage",
                json!({"requestedMessage": "StatusNotification"}),
                json!({"status": "Accepted"}),
            ),
            (
                "TriggerMessage",
                json!({"requestedMessage": "Heartbeat"}),
                json!({"status": "NotImplemented"}),
            ),
            ("CancelReservation", json!({"reservationId": 3}), json!({"status": "Accepted"})),
            (
                "DataTransfer",
                json!({"vendorId": "acme"}),
                json!({"status": "Accepted"}),
            ),
        ];

        for (action, request, expected) in cases {
            let reply = handle_call(&session, &call(action, request)).await.unwrap();
            assert_eq!(reply.payload, expected, "{}", action);
        }
    }

    #[tokio::test]
    async fn test_follow_ups() {
        let session = session("EVC01");

        let reply = handle_call(&session, &call("Reset", json!({"type": "Soft"})))
            .await
            .unwrap();
        assert_eq!(reply.payload, json!({"status": "Accepted"}));
        assert_eq!(
            reply.follow_up,
            Some(FollowUp::Reset {
                reset_type: ResetType::Soft
            })
        );

        let reply = handle_call(
            &session,
            &call("GetDiagnostics", json!({"location": "ftp://example.com/"})),
        )
        .await
        .unwrap();
        assert_eq!(reply.payload, json!({"fileName": "file.tar.gz"}));
        assert_eq!(reply.follow_up, Some(FollowUp::DiagnosticsUpload));
    }

    #[tokio::test]
    async fn test_unimplemented_call() {
        let session = session("EVC01");
        let result = handle_call(&session, &call("UpdateFirmware", json!({}))).await;
        assert!(matches!(
            result,
            Err(ChargePointError::UnimplementedAction { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_results() {
        let session = session("EVC01");

        handle_call_result(
            &session,
            "StartTransaction",
            &json!({"connectorId": 1, "idTag": "TAG", "meterStart": 0, "timestamp": "2024-01-01T00:00:00Z"}),
            &json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 17}),
        )
        .await
        .unwrap();
        assert!(session.transactions().is_active(17));
        assert_eq!(session.transactions().get_transaction_id_by_connector(1), Some(17));

        handle_call_result(
            &session,
            "StopTransaction",
            &json!({"meterStop": 0, "timestamp": "2024-01-01T00:00:00Z", "transactionId": 17}),
            &json!({}),
        )
        .await
        .unwrap();
        assert!(!session.transactions().is_active(17));

        handle_call_result(
            &session,
            "BootNotification",
            &json!({"chargePointVendor": "Vestel", "chargePointModel": "EVC01"}),
            &json!({"currentTime": "2024-01-01T00:00:00Z", "interval": 60, "status": "Accepted"}),
        )
        .await
        .unwrap();
        assert!(session.heartbeat_running().await);

        handle_call_result(&session, "Heartbeat", &json!({}), &json!({"currentTime": "2024-01-01T00:00:00Z"}))
            .await
            .unwrap();

        let result = handle_call_result(&session, "FirmwareStatusNotification", &json!({}), &json!({})).await;
        assert!(matches!(
            result,
            Err(ChargePointError::UnimplementedAction { .. })
        ));
    }
}
