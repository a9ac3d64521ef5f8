//! Payload validation against the OCPP 1.6J message schemas
//!
//! A payload conforms when it deserializes into the typed message for its action and
//! passes that type's [`Validate`] constraints (field lengths, value ranges, non-empty
//! arrays). Any failure is reported as [`OcppError::SchemaViolation`].

use crate::v16j::*;
use crate::OcppAction;
use ocpp_types::{OcppError, OcppResult, OcppVersion};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Whether a payload belongs to a Call or to its CallResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Constraint checks beyond what deserialization enforces.
pub trait Validate {
    fn validate(&self) -> OcppResult<()> {
        Ok(())
    }
}

/// Checks OCPP payloads for a given (version, action, direction).
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    /// Returns `UnimplementedAction` for actions without a known schema.
    pub fn validate(
        version: OcppVersion,
        action: &str,
        direction: Direction,
        payload: &Value,
    ) -> OcppResult<()> {
        match version {
            OcppVersion::V16J => validate_v16(action, direction, payload),
        }
    }

    /// Whether a schema exists for `action`.
    pub fn knows(version: OcppVersion, action: &str) -> bool {
        !matches!(
            Self::validate(version, action, Direction::Request, &Value::Null),
            Err(OcppError::UnimplementedAction { .. })
        )
    }
}

fn validate_v16(action: &str, direction: Direction, payload: &Value) -> OcppResult<()> {
    macro_rules! dispatch {
        ($($request:ty),* $(,)?) => {{
            $(
                if action == <$request as OcppAction>::ACTION_NAME {
                    return match direction {
                        Direction::Request => check::<$request>(action, payload),
                        Direction::Response => {
                            check::<<$request as OcppAction>::Response>(action, payload)
                        }
                    };
                }
            )*
            Err(OcppError::unimplemented(action))
        }};
    }

    dispatch!(
        AuthorizeRequest,
        BootNotificationRequest,
        HeartbeatRequest,
        MeterValuesRequest,
        StartTransactionRequest,
        StatusNotificationRequest,
        StopTransactionRequest,
        DiagnosticsStatusNotificationRequest,
        SecurityEventNotificationRequest,
        DataTransferRequest,
        ChangeAvailabilityRequest,
        ChangeConfigurationRequest,
        ClearCacheRequest,
        GetConfigurationRequest,
        RemoteStartTransactionRequest,
        RemoteStopTransactionRequest,
        ResetRequest,
        UnlockConnectorRequest,
        GetDiagnosticsRequest,
        SetChargingProfileRequest,
        ClearChargingProfileRequest,
        ReserveNowRequest,
        CancelReservationRequest,
        TriggerMessageRequest,
    )
}

fn check<T>(action: &str, payload: &Value) -> OcppResult<()>
where
    T: DeserializeOwned + Validate,
{
    if !payload.is_object() {
        return Err(OcppError::schema_violation(action, "payload must be a JSON object"));
    }
    let typed = T::deserialize(payload)
        .map_err(|e| OcppError::schema_violation(action, e.to_string()))?;
    typed.validate()
}

/// Checks a string against a CiString length limit.
pub fn validate_string_field(
    action: &str,
    field_name: &str,
    value: &str,
    min_length: usize,
    max_length: usize,
) -> OcppResult<()> {
    let len = value.chars().count();
    if len < min_length || len > max_length {
        return Err(OcppError::schema_violation(
            action,
            format!(
                "{} must be {}-{} characters, got {}",
                field_name, min_length, max_length, len
            ),
        ));
    }
    Ok(())
}

fn validate_optional_string(
    action: &str,
    field_name: &str,
    value: Option<&String>,
    max_length: usize,
) -> OcppResult<()> {
    match value {
        Some(value) => validate_string_field(action, field_name, value, 0, max_length),
        None => Ok(()),
    }
}

fn validate_non_negative(action: &str, field_name: &str, value: i32) -> OcppResult<()> {
    if value < 0 {
        return Err(OcppError::schema_violation(
            action,
            format!("{} cannot be negative", field_name),
        ));
    }
    Ok(())
}

impl Validate for AuthorizeRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(Self::ACTION_NAME, "idTag", &self.id_tag, 1, 20)
    }
}

impl Validate for BootNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        validate_string_field(action, "chargePointVendor", &self.charge_point_vendor, 1, 20)?;
        validate_string_field(action, "chargePointModel", &self.charge_point_model, 1, 20)?;
        validate_optional_string(
            action,
            "chargePointSerialNumber",
            self.charge_point_serial_number.as_ref(),
            25,
        )?;
        validate_optional_string(
            action,
            "chargeBoxSerialNumber",
            self.charge_box_serial_number.as_ref(),
            25,
        )?;
        validate_optional_string(action, "firmwareVersion", self.firmware_version.as_ref(), 50)?;
        validate_optional_string(action, "iccid", self.iccid.as_ref(), 20)?;
        validate_optional_string(action, "imsi", self.imsi.as_ref(), 20)?;
        validate_optional_string(action, "meterType", self.meter_type.as_ref(), 25)?;
        validate_optional_string(
            action,
            "meterSerialNumber",
            self.meter_serial_number.as_ref(),
            25,
        )
    }
}

impl Validate for StartTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        if self.connector_id == 0 {
            return Err(OcppError::schema_violation(
                action,
                "connectorId must be greater than 0",
            ));
        }
        validate_string_field(action, "idTag", &self.id_tag, 1, 20)?;
        validate_non_negative(action, "meterStart", self.meter_start)
    }
}

impl Validate for StopTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        validate_optional_string(action, "idTag", self.id_tag.as_ref(), 20)?;
        validate_non_negative(action, "meterStop", self.meter_stop)
    }
}

impl Validate for StatusNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        validate_optional_string(action, "info", self.info.as_ref(), 50)?;
        validate_optional_string(action, "vendorId", self.vendor_id.as_ref(), 255)?;
        validate_optional_string(action, "vendorErrorCode", self.vendor_error_code.as_ref(), 50)
    }
}

impl Validate for MeterValuesRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        if self.meter_value.is_empty() {
            return Err(OcppError::schema_violation(action, "meterValue cannot be empty"));
        }
        for meter_value in &self.meter_value {
            if meter_value.sampled_values.is_empty() {
                return Err(OcppError::schema_violation(
                    action,
                    "sampledValue cannot be empty",
                ));
            }
        }
        Ok(())
    }
}

impl Validate for DataTransferRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        validate_string_field(action, "vendorId", &self.vendor_id, 1, 255)?;
        validate_optional_string(action, "messageId", self.message_id.as_ref(), 50)
    }
}

impl Validate for SecurityEventNotificationRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        validate_string_field(action, "type", &self.event_type, 1, 50)?;
        validate_optional_string(action, "techInfo", self.tech_info.as_ref(), 255)
    }
}

impl Validate for ChangeConfigurationRequest {
    fn validate(&self) -> OcppResult<()> {
        let action = Self::ACTION_NAME;
        validate_string_field(action, "key", &self.key, 1, 50)?;
        validate_string_field(action, "value", &self.value, 0, 500)
    }
}

impl Validate for GetConfigurationRequest {
    fn validate(&self) -> OcppResult<()> {
        for key in self.key.iter().flatten() {
            validate_string_field(Self::ACTION_NAME, "key", key, 1, 50)?;
        }
        Ok(())
    }
}

impl Validate for RemoteStartTransactionRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(Self::ACTION_NAME, "idTag", &self.id_tag, 1, 20)
    }
}

impl Validate for ReserveNowRequest {
    fn validate(&self) -> OcppResult<()> {
        validate_string_field(Self::ACTION_NAME, "idTag", &self.id_tag, 1, 20)?;
        validate_optional_string(
            Self::ACTION_NAME,
            "parentIdTag",
            self.parent_id_tag.as_ref(),
            20,
        )
    }
}

macro_rules! no_extra_constraints {
    ($($ty:ty),* $(,)?) => {
        $(impl Validate for $ty {})*
    };
}

no_extra_constraints!(
    AuthorizeResponse,
    BootNotificationResponse,
    HeartbeatRequest,
    HeartbeatResponse,
    MeterValuesResponse,
    StartTransactionResponse,
    StatusNotificationResponse,
    StopTransactionResponse,
    DiagnosticsStatusNotificationRequest,
    DiagnosticsStatusNotificationResponse,
    SecurityEventNotificationResponse,
    DataTransferResponse,
    ChangeAvailabilityRequest,
    ChangeAvailabilityResponse,
    ChangeConfigurationResponse,
    ClearCacheRequest,
    ClearCacheResponse,
    GetConfigurationResponse,
    RemoteStartTransactionResponse,
    RemoteStopTransactionRequest,
    RemoteStopTransactionResponse,
    ResetRequest,
    ResetResponse,
    UnlockConnectorRequest,
    UnlockConnectorResponse,
    GetDiagnosticsRequest,
    GetDiagnosticsResponse,
    SetChargingProfileRequest,
    SetChargingProfileResponse,
    ClearChargingProfileRequest,
    ClearChargingProfileResponse,
    ReserveNowResponse,
    CancelReservationRequest,
    CancelReservationResponse,
    TriggerMessageRequest,
    TriggerMessageResponse,
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(action: &str, direction: Direction, payload: Value) -> OcppResult<()> {
        SchemaValidator::validate(OcppVersion::V16J, action, direction, &payload)
    }

    #[test]
    fn test_boot_notification_request() {
        assert!(validate(
            "BootNotification",
            Direction::Request,
            json!({"chargePointVendor": "ATESS", "chargePointModel": "EVA-07S-SE"})
        )
        .is_ok());

        let result = validate(
            "BootNotification",
            Direction::Request,
            json!({"chargePointVendor": "ATESS"}),
        );
        assert!(matches!(result, Err(OcppError::SchemaViolation { .. })));
    }

    #[test]
    fn test_vendor_name_too_long() {
        let result = validate(
            "BootNotification",
            Direction::Request,
            json!({
                "chargePointVendor": "A vendor name that is far too long",
                "chargePointModel": "EVC01"
            }),
        );
        match result {
            Err(OcppError::SchemaViolation { action, message }) => {
                assert_eq!(action, "BootNotification");
                assert!(message.contains("chargePointVendor"));
            }
            other => panic!("Expected SchemaViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_response_direction_uses_response_schema() {
        assert!(validate(
            "BootNotification",
            Direction::Response,
            json!({"currentTime": "2024-01-01T00:00:00Z", "interval": 300, "status": "Accepted"})
        )
        .is_ok());
        assert!(validate(
            "StartTransaction",
            Direction::Response,
            json!({"idTagInfo": {"status": "Accepted"}})
        )
        .is_err());
    }

    #[test]
    fn test_status_notification_rejects_unknown_status() {
        let result = validate(
            "StatusNotification",
            Direction::Request,
            json!({"connectorId": 1, "errorCode": "NoError", "status": "Offline"}),
        );
        assert!(matches!(result, Err(OcppError::SchemaViolation { .. })));
    }

    #[test]
    fn test_start_transaction_connector_zero() {
        let result = validate(
            "StartTransaction",
            Direction::Request,
            json!({
                "connectorId": 0,
                "idTag": "freevenIdTag",
                "meterStart": 0,
                "timestamp": "2024-01-01T00:00:00Z"
            }),
        );
        assert!(matches!(result, Err(OcppError::SchemaViolation { .. })));
    }

    #[test]
    fn test_payload_must_be_object() {
        let result = validate("Heartbeat", Direction::Request, json!([]));
        assert!(matches!(result, Err(OcppError::SchemaViolation { .. })));
    }

    #[test]
    fn test_unknown_action() {
        let result = validate("UpdateFirmware", Direction::Request, json!({}));
        assert!(matches!(result, Err(OcppError::UnimplementedAction { .. })));
        assert!(!SchemaValidator::knows(OcppVersion::V16J, "UpdateFirmware"));
        assert!(SchemaValidator::knows(OcppVersion::V16J, "GetDiagnostics"));
    }

    #[test]
    fn test_string_field_limits() {
        assert!(validate_string_field("Authorize", "idTag", "", 1, 20).is_err());
        assert!(validate_string_field("Authorize", "idTag", "TAG", 1, 20).is_ok());
        assert!(validate_string_field("Authorize", "idTag", &"x".repeat(21), 1, 20).is_err());
    }
}
