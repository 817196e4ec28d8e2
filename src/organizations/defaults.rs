use chrono::Duration;
use serde::Serialize;
use serde_json::Value;

pub const SETTINGS_VERSION: u32 = 1;
pub const TRIAL_PERIOD_DAYS: i64 = 14;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub code: &'static str,
    pub label: &'static str,
    pub required: bool,
    pub photo_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_photos: Option<u8>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ServiceType {
    pub code: &'static str,
    pub label: &'static str,
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NotificationDefaults {
    pub email_intake: bool,
    pub email_complete: bool,
    pub email_ready: bool,
    pub sms_intake: bool,
    pub sms_ready: bool,
}

/// Settings seeded into every new tenant.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OrganizationDefaults {
    pub version: u32,
    pub checkpoints: Vec<Checkpoint>,
    pub service_types: Vec<ServiceType>,
    pub notifications: NotificationDefaults,
    #[serde(skip)]
    pub trial_days: i64,
}

impl OrganizationDefaults {
    pub fn trial_period(&self) -> Duration {
        Duration::days(self.trial_days)
    }

    pub fn settings(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Default for OrganizationDefaults {
    fn default() -> Self {
        let checkpoint = |code, label, required, photo_required, min_photos| Checkpoint {
            code,
            label,
            required,
            photo_required,
            min_photos,
        };
        Self {
            version: SETTINGS_VERSION,
            checkpoints: vec![
                checkpoint("intake", "Received", true, true, Some(1)),
                checkpoint("prepared", "Prepared for Cremation", true, true, Some(1)),
                checkpoint("entering_chamber", "Entering Chamber", true, true, Some(2)),
                checkpoint("cremated", "Cremation Complete", true, true, Some(1)),
                checkpoint("packaged", "Packaged", true, true, Some(1)),
                checkpoint("ready", "Ready for Pickup", true, false, None),
                checkpoint("completed", "Picked Up / Delivered", false, false, None),
            ],
            service_types: vec![
                ServiceType {
                    code: "private",
                    label: "Private Cremation",
                    enabled: true,
                },
                ServiceType {
                    code: "individual",
                    label: "Individual Cremation",
                    enabled: true,
                },
                ServiceType {
                    code: "communal",
                    label: "Communal Cremation",
                    enabled: true,
                },
            ],
            notifications: NotificationDefaults {
                email_intake: true,
                email_complete: true,
                email_ready: true,
                sms_intake: true,
                sms_ready: true,
            },
            trial_days: TRIAL_PERIOD_DAYS,
        }
    }
}
