//! Vendor capability profiles and the per-session configuration store they seed.

use crate::error::{ChargePointError, ChargePointResult};
use ocpp_messages::v16j::StatusNotificationRequest;
use ocpp_types::common::KeyValue;
use ocpp_types::v16j::ChargePointStatus;
use std::collections::{HashMap, HashSet};

const ATESS_PUBLIC: &str = include_str!("../data/vendor/atess_public.json");
const ATESS_PRIVATE: &str = include_str!("../data/vendor/atess_private.json");
const VESTEL: &str = include_str!("../data/vendor/vestel.json");
const VESTEL_EVC03: &str = include_str!("../data/vendor/vestel_evc03.json");
const KEBA: &str = include_str!("../data/vendor/keba.json");
const GL_EVIQ: &str = include_str!("../data/vendor/gl_eviq.json");
const EN_PLUS_22KW: &str = include_str!("../data/vendor/en_plus_22kw.json");

/// Model whose table differs from the rest of the Vestel range.
const VESTEL_EVC03_MODEL: &str = "EVC03";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Atess,
    Vestel,
    Keba,
    GlEviq,
    EnPlus,
    Unknown,
}

impl Vendor {
    /// Derives the vendor from a model string by substring match.
    pub fn from_model(model: &str) -> Self {
        if model.contains("EVA") {
            Vendor::Atess
        } else if model.contains("EVC") {
            Vendor::Vestel
        } else if model.contains("KC-P") {
            Vendor::Keba
        } else if model.contains("GL-EVIQ") {
            Vendor::GlEviq
        } else if model.contains("AC022K") {
            Vendor::EnPlus
        } else {
            Vendor::Unknown
        }
    }

    /// Name reported as `chargePointVendor`.
    pub fn name(&self) -> &'static str {
        match self {
            Vendor::Atess => "ATESS",
            Vendor::Vestel => "Vestel",
            Vendor::Keba => "Keba",
            Vendor::GlEviq => "GL_EVIQ",
            Vendor::EnPlus => "EN+",
            Vendor::Unknown => "Unknown-vendor",
        }
    }

    pub fn default_firmware(&self) -> &'static str {
        match self {
            Vendor::Atess => "EVA-07S_SE-V4.2.9-20220610",
            Vendor::Vestel => "v4.28.0-1.5.154.0-v8.0.8",
            Vendor::EnPlus => "1.4.918",
            _ => "1.0.0",
        }
    }

    /// Configuration key holding the maximum random start delay, in seconds.
    pub fn random_delay_key(&self) -> Option<&'static str> {
        match self {
            Vendor::Atess | Vendor::GlEviq => Some("G_RandDelayChargeTime"),
            Vendor::Vestel => Some("RandomisedDelayMaxSeconds"),
            Vendor::Keba => Some("RandomProfileMaxDelay"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Vendor-specific behavior, selected once per session from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorProfile {
    pub vendor: Vendor,
    pub model: String,
    pub firmware_version: String,
}

impl VendorProfile {
    pub fn for_model(model: impl Into<String>) -> Self {
        let model = model.into();
        let vendor = Vendor::from_model(&model);
        Self {
            vendor,
            firmware_version: vendor.default_firmware().to_string(),
            model,
        }
    }

    /// Builds the configuration table this vendor/model ships with.
    pub fn seed_configuration(&self) -> ChargePointResult<ConfigurationStore> {
        let store = match self.vendor {
            Vendor::Atess => {
                let public = parse_table(ATESS_PUBLIC)?;
                let public_keys = public.iter().map(|kv| kv.key.clone()).collect();
                let mut entries = public;
                entries.extend(parse_table(ATESS_PRIVATE)?);
                ConfigurationStore::new(entries, Visibility::Only(public_keys))
            }
            Vendor::Vestel if self.model == VESTEL_EVC03_MODEL => {
                ConfigurationStore::new(parse_table(VESTEL_EVC03)?, Visibility::All)
            }
            Vendor::Vestel => ConfigurationStore::new(parse_table(VESTEL)?, Visibility::All),
            Vendor::Keba => ConfigurationStore::new(parse_table(KEBA)?, Visibility::All),
            Vendor::GlEviq => ConfigurationStore::new(parse_table(GL_EVIQ)?, Visibility::All),
            Vendor::EnPlus => {
                ConfigurationStore::new(parse_table(EN_PLUS_22KW)?, Visibility::All)
            }
            Vendor::Unknown => ConfigurationStore::new(Vec::new(), Visibility::Nothing),
        };
        Ok(store)
    }

    pub fn random_delay_key(&self) -> Option<&'static str> {
        self.vendor.random_delay_key()
    }

    /// StatusNotification sent while a connector sits out its random start delay.
    pub fn waiting_notification(
        &self,
        connector_id: u32,
        delay_secs: u64,
    ) -> Option<StatusNotificationRequest> {
        match self.vendor {
            Vendor::Atess | Vendor::GlEviq => Some(
                StatusNotificationRequest::new(connector_id, ChargePointStatus::Preparing)
                    .with_info("RandDelayWait"),
            ),
            Vendor::Vestel => Some(
                StatusNotificationRequest::new(connector_id, ChargePointStatus::SuspendedEVSE)
                    .with_info(format!("RandomizedDelay={}", delay_secs)),
            ),
            _ => None,
        }
    }
}

fn parse_table(raw: &str) -> ChargePointResult<Vec<KeyValue>> {
    serde_json::from_str(raw).map_err(|e| {
        ChargePointError::configuration(format!("invalid vendor configuration table: {}", e))
    })
}

/// Which keys a GetConfiguration without a key list returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    All,
    Only(HashSet<String>),
    Nothing,
}

/// Mutable key/value/readonly table, in the order the vendor reports it.
#[derive(Debug, Clone)]
pub struct ConfigurationStore {
    entries: Vec<KeyValue>,
    index: HashMap<String, usize>,
    visibility: Visibility,
}

impl ConfigurationStore {
    pub fn new(entries: Vec<KeyValue>, visibility: Visibility) -> Self {
        let mut store = Self {
            entries: Vec::with_capacity(entries.len()),
            index: HashMap::with_capacity(entries.len()),
            visibility,
        };
        for entry in entries {
            // later tables override earlier ones
            match store.index.get(&entry.key) {
                Some(&i) => store.entries[i] = entry,
                None => {
                    store.index.insert(entry.key.clone(), store.entries.len());
                    store.entries.push(entry);
                }
            }
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<&KeyValue> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|kv| kv.value.as_deref())
    }

    /// Sets a writable key. Unknown and readonly keys are left untouched.
    pub fn update(&mut self, key: &str, value: impl Into<String>) -> bool {
        match self.index.get(key) {
            Some(&i) if !self.entries[i].readonly => {
                self.entries[i].value = Some(value.into());
                true
            }
            _ => false,
        }
    }

    /// Returns `(configurationKey, unknownKey)` for a GetConfiguration request.
    pub fn configuration(&self, keys: Option<&[String]>) -> (Vec<KeyValue>, Vec<String>) {
        match keys {
            Some(keys) if !keys.is_empty() => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for key in keys {
                    match self.get(key) {
                        Some(kv) => known.push(kv.clone()),
                        None => unknown.push(key.clone()),
                    }
                }
                (known, unknown)
            }
            _ => {
                let visible = match &self.visibility {
                    Visibility::All => self.entries.clone(),
                    Visibility::Only(public) => self
                        .entries
                        .iter()
                        .filter(|kv| public.contains(&kv.key))
                        .cloned()
                        .collect(),
                    Visibility::Nothing => Vec::new(),
                };
                (visible, Vec::new())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
