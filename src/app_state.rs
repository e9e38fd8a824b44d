//! In-memory application state and its mapping onto the two backends.
//!
//! [`AppState`] is the aggregate the state-management layer mutates. Each
//! field has exactly one owning backend:
//!
//! - entity collections (and the two nested lists `wellnessStats.breaks`
//!   and `gamificationStats.historico`) live in the entity backend, one
//!   collection each, addressed through [`AppState::collection`];
//! - everything listed in [`SETTINGS_MAP`] lives in the settings backend
//!   under its own key;
//! - the scalar half of the gamification aggregate is stored as one
//!   composite settings value, [`GamificationCore`].
//!
//! Change detection is by reference: collections and composite settings are
//! `Arc`s and a field counts as changed when its `Arc` was replaced. Scalar
//! settings compare by value.

use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::local_db_model::Collection;
use crate::store_error::StoreResult;

/// Settings keys that do not map onto an [`AppState`] field one-to-one.
pub mod keys {
    pub const GAMIFICATION_CORE: &str = "gamificationCore";
    pub const CURRENT_PROJECT: &str = "currentProject";
    pub const THEME: &str = "theme";
    pub const LAST_RECURRING_CHECK: &str = "lastRecurringCheck";
    pub const LAST_FINANCIAL_RECURRING_CHECK: &str = "lastFinancialRecurringCheck";
    pub const DB_MIGRATED: &str = "dbMigrated";

    /// Settings that live outside the state aggregate.
    pub const LOOSE: &[&str] =
        &[CURRENT_PROJECT, THEME, LAST_RECURRING_CHECK, LAST_FINANCIAL_RECURRING_CHECK];
}

pub const DEFAULT_PROJECT_ID: &str = "default";
pub const DEFAULT_THEME: &str = "dark";

pub const DEFAULT_ENABLED_MODULES: &[&str] = &[
    "dashboard", "tutorial", "wellness", "musica", "favorites", "notes",
    "prompts", "snippets", "cheatsheet", "kanban", "checklists",
    "passwords", "contacts", "orcamentos", "precificador", "estoque",
    "fichatecnica", "finance", "diary", "draft", "settings",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: DEFAULT_PROJECT_ID.to_string(),
            name: "Projeto Padrão".to_string(),
            color: "#dc3545".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PomodoroStats {
    pub focus_sessions: u64,
    pub total_minutes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BillingInfo {
    pub company_name: String,
    pub address: String,
    pub tax_id: String,
    pub logo_url: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingData {
    pub fixed_costs: f64,
    pub desired_salary: f64,
    pub taxes_percent: f64,
    pub hours_per_day: f64,
    pub days_per_month: f64,
    pub ideal_hourly_rate: f64,
}

impl Default for PricingData {
    fn default() -> Self {
        Self {
            fixed_costs: 0.0,
            desired_salary: 0.0,
            taxes_percent: 0.0,
            hours_per_day: 8.0,
            days_per_month: 22.0,
            ideal_hourly_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellnessStats {
    pub breaks: Collection,
}

/// Points, level, badges, timer durations and the point history.
///
/// Split across backends: `history` is the `gamificationHistory`
/// collection, the rest is persisted as one [`GamificationCore`] value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GamificationStats {
    #[serde(rename = "pontos")]
    pub points: i64,
    #[serde(rename = "nivel")]
    pub level: u32,
    #[serde(rename = "historico")]
    pub history: Collection,
    pub badges: Arc<Vec<JsonValue>>,
    pub focus_duration: u32,
    pub short_break_duration: u32,
    pub long_break_duration: u32,
}

impl Default for GamificationStats {
    fn default() -> Self {
        GamificationCore::default().into_stats(Collection::default())
    }
}

/// The settings-backed part of [`GamificationStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GamificationCore {
    #[serde(rename = "pontos")]
    pub points: i64,
    #[serde(rename = "nivel")]
    pub level: u32,
    pub badges: Arc<Vec<JsonValue>>,
    pub focus_duration: u32,
    pub short_break_duration: u32,
    pub long_break_duration: u32,
}

impl Default for GamificationCore {
    fn default() -> Self {
        Self {
            points: 0,
            level: 1,
            badges: Arc::default(),
            focus_duration: 25,
            short_break_duration: 5,
            long_break_duration: 15,
        }
    }
}

impl GamificationCore {
    pub fn from_stats(stats: &GamificationStats) -> Self {
        Self {
            points: stats.points,
            level: stats.level,
            badges: Arc::clone(&stats.badges),
            focus_duration: stats.focus_duration,
            short_break_duration: stats.short_break_duration,
            long_break_duration: stats.long_break_duration,
        }
    }

    pub fn into_stats(self, history: Collection) -> GamificationStats {
        GamificationStats {
            points: self.points,
            level: self.level,
            history,
            badges: self.badges,
            focus_duration: self.focus_duration,
            short_break_duration: self.short_break_duration,
            long_break_duration: self.long_break_duration,
        }
    }

    /// Compares the five persisted sub-fields individually; badges by
    /// reference, the scalars by value.
    pub fn changed_between(prev: &GamificationStats, next: &GamificationStats) -> bool {
        prev.points != next.points
            || prev.level != next.level
            || !Arc::ptr_eq(&prev.badges, &next.badges)
            || prev.focus_duration != next.focus_duration
            || prev.short_break_duration != next.short_break_duration
            || prev.long_break_duration != next.long_break_duration
    }

    /// Decodes a persisted core value. Each sub-field falls back to its own
    /// default when missing, null or of the wrong type; a value that is not
    /// an object yields the defaults.
    pub fn from_setting(value: Option<JsonValue>) -> Self {
        let defaults = Self::default();
        let fields = match value {
            Some(JsonValue::Object(fields)) => fields,
            None | Some(JsonValue::Null) => return defaults,
            Some(other) => {
                warn!("Ignoring malformed {}: {other}", keys::GAMIFICATION_CORE);
                return defaults;
            }
        };

        Self {
            points: core_field(&fields, "pontos", defaults.points),
            level: core_field(&fields, "nivel", defaults.level),
            badges: core_field(&fields, "badges", defaults.badges),
            focus_duration: core_field(&fields, "focusDuration", defaults.focus_duration),
            short_break_duration: core_field(
                &fields,
                "shortBreakDuration",
                defaults.short_break_duration,
            ),
            long_break_duration: core_field(
                &fields,
                "longBreakDuration",
                defaults.long_break_duration,
            ),
        }
    }
}

fn core_field<T: DeserializeOwned>(fields: &JsonMap<String, JsonValue>, name: &str, default: T) -> T {
    match fields.get(name) {
        None | Some(JsonValue::Null) => default,
        Some(value) => T::deserialize(value).unwrap_or_else(|e| {
            warn!("Ignoring malformed {}.{name}: {e}", keys::GAMIFICATION_CORE);
            default
        }),
    }
}

/// The whole application state.
///
/// Deserializes from a backup document (or the legacy blob) with every
/// missing field defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppState {
    pub projects: Arc<Vec<Project>>,
    pub notes: Collection,
    pub prompts: Collection,
    pub snippets: Collection,
    pub cheatsheet: Collection,
    pub kanban: Collection,
    pub passwords: Collection,
    pub bookmarks: Collection,
    pub diary: Collection,
    pub draft: String,
    pub pomodoro_stats: Arc<PomodoroStats>,
    pub wellness_stats: WellnessStats,
    pub gamification_stats: GamificationStats,
    pub note_templates: Arc<Vec<String>>,
    pub task_templates: Arc<Vec<JsonValue>>,
    pub encrypted_passwords: Option<String>,
    pub financial_accounts: Collection,
    pub financial_categories: Collection,
    pub financial_budgets: Collection,
    pub financial_transactions: Collection,
    pub encrypted_financial: Option<String>,
    pub contacts: Collection,
    pub contact_tags: Arc<Vec<String>>,
    pub encrypted_contacts: Option<String>,
    pub checklists: Collection,
    pub encrypted_checklists: Option<String>,
    pub music_player_volume: f64,
    pub music_player_shuffle: bool,
    pub music_player_repeat: bool,
    pub billing_info: Arc<BillingInfo>,
    pub service_catalog: Collection,
    pub budgets: Collection,
    pub encrypted_budgets: Option<String>,
    pub pricing_data: Arc<PricingData>,
    pub encrypted_pricing_data: Option<String>,
    pub stock_materials: Collection,
    pub encrypted_stock: Option<String>,
    pub tech_sheets: Collection,
    pub encrypted_tech_sheets: Option<String>,
    pub enabled_modules: Arc<Vec<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            projects: Arc::new(vec![Project::default()]),
            notes: Collection::default(),
            prompts: Collection::default(),
            snippets: Collection::default(),
            cheatsheet: Collection::default(),
            kanban: Collection::default(),
            passwords: Collection::default(),
            bookmarks: Collection::default(),
            diary: Collection::default(),
            draft: String::new(),
            pomodoro_stats: Arc::default(),
            wellness_stats: WellnessStats::default(),
            gamification_stats: GamificationStats::default(),
            note_templates: Arc::default(),
            task_templates: Arc::default(),
            encrypted_passwords: None,
            financial_accounts: Collection::default(),
            financial_categories: Collection::default(),
            financial_budgets: Collection::default(),
            financial_transactions: Collection::default(),
            encrypted_financial: None,
            contacts: Collection::default(),
            contact_tags: Arc::default(),
            encrypted_contacts: None,
            checklists: Collection::default(),
            encrypted_checklists: None,
            music_player_volume: 0.7,
            music_player_shuffle: false,
            music_player_repeat: false,
            billing_info: Arc::default(),
            service_catalog: Collection::default(),
            budgets: Collection::default(),
            encrypted_budgets: None,
            pricing_data: Arc::default(),
            encrypted_pricing_data: None,
            stock_materials: Collection::default(),
            encrypted_stock: None,
            tech_sheets: Collection::default(),
            encrypted_tech_sheets: None,
            enabled_modules: Arc::new(
                DEFAULT_ENABLED_MODULES.iter().map(|m| m.to_string()).collect(),
            ),
        }
    }
}

/// How one settings-backed field is compared, encoded and decoded.
pub(crate) trait SettingField: Serialize + DeserializeOwned {
    fn differs(&self, other: &Self) -> bool;
}

impl<T: Serialize + DeserializeOwned> SettingField for Arc<T> {
    fn differs(&self, other: &Self) -> bool {
        !Arc::ptr_eq(self, other)
    }
}

macro_rules! by_value {
    ($($ty:ty),*) => {
        $(impl SettingField for $ty {
            fn differs(&self, other: &Self) -> bool {
                self != other
            }
        })*
    };
}

by_value!(String, f64, bool, Option<String>);

fn decode_into<T: SettingField>(slot: &mut T, key: &str, value: JsonValue) {
    match serde_json::from_value(value) {
        Ok(decoded) => *slot = decoded,
        Err(e) => warn!("Ignoring malformed setting '{key}': {e}"),
    }
}

/// One settings-backed [`AppState`] field.
pub struct SettingsMapping {
    pub key: &'static str,
    pub changed: fn(&AppState, &AppState) -> bool,
    pub encode: fn(&AppState) -> StoreResult<JsonValue>,
    pub decode: fn(&mut AppState, JsonValue),
}

macro_rules! settings_map {
    ($($key:literal => $field:ident),* $(,)?) => {
        /// Settings fields persisted one key per field.
        pub const SETTINGS_MAP: &[SettingsMapping] = &[
            $(SettingsMapping {
                key: $key,
                changed: |prev, next| prev.$field.differs(&next.$field),
                encode: |state| Ok(serde_json::to_value(&state.$field)?),
                decode: |state, value| decode_into(&mut state.$field, $key, value),
            },)*
        ];
    };
}

settings_map! {
    "projects" => projects,
    "pomodoroStats" => pomodoro_stats,
    "billingInfo" => billing_info,
    "pricingData" => pricing_data,
    "draft" => draft,
    "noteTemplates" => note_templates,
    "taskTemplates" => task_templates,
    "contactTags" => contact_tags,
    "enabledModules" => enabled_modules,
    "musicPlayerVolume" => music_player_volume,
    "musicPlayerShuffle" => music_player_shuffle,
    "musicPlayerRepeat" => music_player_repeat,
    "encryptedPasswords" => encrypted_passwords,
    "encryptedFinancial" => encrypted_financial,
    "encryptedContacts" => encrypted_contacts,
    "encryptedChecklists" => encrypted_checklists,
    "encryptedBudgets" => encrypted_budgets,
    "encryptedPricingData" => encrypted_pricing_data,
    "encryptedStock" => encrypted_stock,
    "encryptedTechSheets" => encrypted_tech_sheets,
}

macro_rules! entity_map {
    ($($store:literal => $($path:ident).+),* $(,)?) => {
        impl AppState {
            /// The collection backing entity store `store`, if it is one.
            pub fn collection(&self, store: &str) -> Option<&Collection> {
                match store {
                    $($store => Some(&self.$($path).+),)*
                    _ => None,
                }
            }

            pub fn collection_mut(&mut self, store: &str) -> Option<&mut Collection> {
                match store {
                    $($store => Some(&mut self.$($path).+),)*
                    _ => None,
                }
            }
        }
    };
}

entity_map! {
    "notes" => notes,
    "prompts" => prompts,
    "snippets" => snippets,
    "cheatsheet" => cheatsheet,
    "kanban" => kanban,
    "passwords" => passwords,
    "bookmarks" => bookmarks,
    "diary" => diary,
    "contacts" => contacts,
    "checklists" => checklists,
    "financialAccounts" => financial_accounts,
    "financialCategories" => financial_categories,
    "financialBudgets" => financial_budgets,
    "financialTransactions" => financial_transactions,
    "wellnessBreaks" => wellness_stats.breaks,
    "gamificationHistory" => gamification_stats.history,
    "budgets" => budgets,
    "serviceCatalog" => service_catalog,
    "stockMaterials" => stock_materials,
    "techSheets" => tech_sheets,
}

/// Every key read when reconstructing state.
pub fn load_keys() -> Vec<&'static str> {
    SETTINGS_MAP
        .iter()
        .map(|mapping| mapping.key)
        .chain([keys::GAMIFICATION_CORE])
        .chain(keys::LOOSE.iter().copied())
        .collect()
}
