//! OCPP 1.6J request and response payloads
//!
//! Only the actions a virtual charge point sends or answers are modelled. Messages are
//! grouped by who initiates them.

use crate::{OcppAction, OcppResponse};
use chrono::{DateTime, Utc};
use ocpp_types::{common::*, v16j::*, IdToken};
use serde::{Deserialize, Serialize};

macro_rules! ocpp_action {
    ($name:literal, $request:ty => $response:ty) => {
        impl OcppAction for $request {
            const ACTION_NAME: &'static str = $name;
            type Response = $response;
        }

        impl OcppAction for $response {
            const ACTION_NAME: &'static str = concat!($name, "Response");
            type Response = Self;
        }

        impl OcppResponse for $response {}
    };
}

// =============================================================================
// Initiated by the charge point
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: IdToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

ocpp_action!("Authorize", AuthorizeRequest => AuthorizeResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

impl BootNotificationRequest {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            charge_point_vendor: vendor.into(),
            charge_point_model: model.into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: None,
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds.
    pub interval: i32,
    pub status: RegistrationStatus,
}

ocpp_action!("BootNotification", BootNotificationRequest => BootNotificationResponse);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

ocpp_action!("Heartbeat", HeartbeatRequest => HeartbeatResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesResponse {}

ocpp_action!("MeterValues", MeterValuesRequest => MeterValuesResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: IdToken,
    /// Energy register at start, in Wh.
    pub meter_start: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

ocpp_action!("StartTransaction", StartTransactionRequest => StartTransactionResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u32,
    pub error_code: ChargePointErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub status: ChargePointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
}

impl StatusNotificationRequest {
    /// A `NoError` notification for one connector.
    pub fn new(connector_id: u32, status: ChargePointStatus) -> Self {
        Self {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            info: None,
            status,
            timestamp: None,
            vendor_id: None,
            vendor_error_code: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_error_code(mut self, error_code: ChargePointErrorCode) -> Self {
        self.error_code = error_code;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

ocpp_action!("StatusNotification", StatusNotificationRequest => StatusNotificationResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<IdToken>,
    /// Energy register at stop, in Wh.
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<Vec<MeterValue>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

ocpp_action!("StopTransaction", StopTransactionRequest => StopTransactionResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationRequest {
    pub status: DiagnosticsStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStatusNotificationResponse {}

ocpp_action!(
    "DiagnosticsStatusNotification",
    DiagnosticsStatusNotificationRequest => DiagnosticsStatusNotificationResponse
);

/// Security whitepaper extension used for tamper and firmware events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEventNotificationRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tech_info: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityEventNotificationResponse {}

ocpp_action!(
    "SecurityEventNotification",
    SecurityEventNotificationRequest => SecurityEventNotificationResponse
);

// =============================================================================
// Initiated by either side
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

ocpp_action!("DataTransfer", DataTransferRequest => DataTransferResponse);

// =============================================================================
// Initiated by the central system
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    pub connector_id: u32,
    #[serde(rename = "type")]
    pub availability_type: AvailabilityType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAvailabilityResponse {
    pub status: AvailabilityStatus,
}

ocpp_action!("ChangeAvailability", ChangeAvailabilityRequest => ChangeAvailabilityResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

ocpp_action!("ChangeConfiguration", ChangeConfigurationRequest => ChangeConfigurationResponse);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub status: ClearCacheStatus,
}

ocpp_action!("ClearCache", ClearCacheRequest => ClearCacheResponse);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    #[serde(default)]
    pub configuration_key: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_key: Vec<String>,
}

ocpp_action!("GetConfiguration", GetConfigurationRequest => GetConfigurationResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    pub id_tag: IdToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStartTransactionResponse {
    pub status: RemoteStartStopStatus,
}

ocpp_action!(
    "RemoteStartTransaction",
    RemoteStartTransactionRequest => RemoteStartTransactionResponse
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStopTransactionResponse {
    pub status: RemoteStartStopStatus,
}

ocpp_action!(
    "RemoteStopTransaction",
    RemoteStopTransactionRequest => RemoteStopTransactionResponse
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub reset_type: ResetType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: ResetStatus,
}

ocpp_action!("Reset", ResetRequest => ResetResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockConnectorResponse {
    pub status: UnlockStatus,
}

ocpp_action!("UnlockConnector", UnlockConnectorRequest => UnlockConnectorResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsRequest {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

ocpp_action!("GetDiagnostics", GetDiagnosticsRequest => GetDiagnosticsResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: u32,
    pub cs_charging_profiles: ChargingProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChargingProfileResponse {
    pub status: ChargingProfileStatus,
}

ocpp_action!("SetChargingProfile", SetChargingProfileRequest => SetChargingProfileResponse);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearChargingProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile_purpose: Option<ChargingProfilePurposeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearChargingProfileResponse {
    pub status: ClearChargingProfileStatus,
}

ocpp_action!(
    "ClearChargingProfile",
    ClearChargingProfileRequest => ClearChargingProfileResponse
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowRequest {
    pub connector_id: u32,
    pub expiry_date: DateTime<Utc>,
    pub id_tag: IdToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<IdToken>,
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveNowResponse {
    pub status: ReservationStatus,
}

ocpp_action!("ReserveNow", ReserveNowRequest => ReserveNowResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReservationResponse {
    pub status: CancelReservationStatus,
}

ocpp_action!("CancelReservation", CancelReservationRequest => CancelReservationResponse);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessageRequest {
    pub requested_message: MessageTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessageResponse {
    pub status: TriggerMessageStatus,
}

ocpp_action!("TriggerMessage", TriggerMessageRequest => TriggerMessageResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boot_notification_skips_absent_fields() {
        let mut request = BootNotificationRequest::new("ATESS", "EVA-07S-SE");
        request.firmware_version = Some("1.0.0".to_string());

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({
                "chargePointVendor": "ATESS",
                "chargePointModel": "EVA-07S-SE",
                "firmwareVersion": "1.0.0"
            })
        );
    }

    #[test]
    fn test_status_notification_shape() {
        let request = StatusNotificationRequest::new(1, ChargePointStatus::Preparing)
            .with_info("RandDelayWait");

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({
                "connectorId": 1,
                "errorCode": "NoError",
                "info": "RandDelayWait",
                "status": "Preparing"
            })
        );
    }

    #[test]
    fn test_remote_start_without_connector() {
        let request: RemoteStartTransactionRequest =
            serde_json::from_value(json!({"idTag": "ABC"})).unwrap();
        assert_eq!(request.connector_id, None);
        assert_eq!(request.id_tag, "ABC");
    }

    #[test]
    fn test_get_configuration_response_field_names() {
        let response = GetConfigurationResponse {
            configuration_key: vec![KeyValue {
                key: "HeartbeatInterval".into(),
                readonly: false,
                value: Some("300".into()),
            }],
            unknown_key: vec!["Nope".into()],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["configurationKey"][0]["key"], "HeartbeatInterval");
        assert_eq!(json["unknownKey"][0], "Nope");
    }

    #[test]
    fn test_reset_and_security_event_rename_type() {
        let reset: ResetRequest = serde_json::from_value(json!({"type": "Soft"})).unwrap();
        assert_eq!(reset.reset_type, ResetType::Soft);

        let event: SecurityEventNotificationRequest = serde_json::from_value(json!({
            "type": "TamperDetectionActivated",
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.event_type, "TamperDetectionActivated");
    }

    #[test]
    fn test_action_names() {
        assert_eq!(BootNotificationRequest::ACTION_NAME, "BootNotification");
        assert_eq!(
            BootNotificationResponse::ACTION_NAME,
            "BootNotificationResponse"
        );
        assert_eq!(
            DiagnosticsStatusNotificationRequest::ACTION_NAME,
            "DiagnosticsStatusNotification"
        );
        assert_eq!(TriggerMessageRequest::ACTION_NAME, "TriggerMessage");
    }
}
