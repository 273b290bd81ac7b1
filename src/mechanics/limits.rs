//! Per-session limits with periodic reset.

use super::{now_ts, Id, Timestamp, ETERNITY};
use crate::registry::Registry;
use crate::{Error, Result, SObj, SVal};
use chrono::{Datelike, Days, Local, NaiveDate, TimeZone};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Reset behavior of a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    /// No automatic reset boundary; only the optional duration.
    None,
    /// Resets at local midnight.
    Daily,
    /// Resets at the start of Monday.
    Weekly,
    /// Resets on the first of the month.
    Monthly,
    /// Resets on January 1st.
    Yearly,
    /// Wraps past the maximum back to the start value.
    Loop,
    /// Degenerate blocker: already reached.
    Always,
    /// Degenerate pass-through: never reachable.
    Never,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::None => "none",
            LimitType::Daily => "daily",
            LimitType::Weekly => "weekly",
            LimitType::Monthly => "monthly",
            LimitType::Yearly => "yearly",
            LimitType::Loop => "loop",
            LimitType::Always => "always",
            LimitType::Never => "never",
        }
    }
}

/// Immutable definition of a limit.
#[derive(Debug)]
pub struct LimitConfig {
    pub id: Id,
    pub limit_type: LimitType,
    pub start: u32,
    pub max: u32,
    /// Optional cap on how long a window may stay open, in seconds.
    pub duration: Option<i64>,
}

/// Write-once table of limit definitions.
#[derive(Debug, Default)]
pub struct LimitManager {
    configs: Registry<Arc<LimitConfig>>,
}

impl LimitManager {
    pub fn new() -> Self {
        LimitManager::default()
    }

    pub fn define(&self, config: LimitConfig) -> Result<()> {
        if config.limit_type == LimitType::Loop && config.max <= config.start {
            return Err(Error::Config(format!(
                "loop limit `{}` needs max above start",
                config.id
            )));
        }
        self.configs.register(config.id.clone(), Arc::new(config))
    }

    pub fn get(&self, id: &str) -> Option<Arc<LimitConfig>> {
        self.configs.get(id)
    }
}

static GLOBAL: LazyLock<LimitManager> = LazyLock::new(LimitManager::new);

pub fn limit_manager() -> &'static LimitManager {
    &GLOBAL
}

/// First second of the next period of `limit_type` after today.
fn next_boundary(limit_type: LimitType) -> Timestamp {
    let today = Local::now().date_naive();
    let next = match limit_type {
        LimitType::Daily => today.checked_add_days(Days::new(1)),
        LimitType::Weekly => {
            let until_monday = 7 - u64::from(today.weekday().num_days_from_monday());
            today.checked_add_days(Days::new(until_monday))
        }
        LimitType::Monthly => {
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)
        }
        LimitType::Yearly => NaiveDate::from_ymd_opt(today.year() + 1, 1, 1),
        _ => None,
    };

    let Some(date) = next else {
        return ETERNITY;
    };
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return ETERNITY;
    };
    match Local.from_local_datetime(&midnight).earliest() {
        Some(moment) => moment.timestamp(),
        None => midnight.and_utc().timestamp(),
    }
}

/// A live limit instance.
#[derive(Debug)]
pub struct Limit {
    pub id: Id,
    /// Optional sub-key distinguishing instances of the same config.
    pub clarifier: String,
    config: Arc<LimitConfig>,
    value: u32,
    expire: Timestamp,
    changed: bool,
}

impl Limit {
    fn new(manager: &LimitManager, id: &str, clarifier: &str) -> Result<Limit> {
        let config = manager
            .get(id)
            .ok_or_else(|| Error::Config(format!("not found config for limit `{id}`")))?;
        Ok(Limit {
            id: id.to_string(),
            clarifier: clarifier.to_string(),
            value: config.start,
            config,
            expire: 0,
            changed: false,
        })
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn expire(&self) -> Timestamp {
        self.expire
    }

    pub fn is_expired(&self) -> bool {
        self.expire > 0 && self.expire != ETERNITY && self.expire < now_ts()
    }

    /// How much room is left before the limit blocks.
    pub fn remain(&self) -> u32 {
        match self.config.limit_type {
            LimitType::Always => 0,
            LimitType::Never | LimitType::Loop => 1,
            _ => self.config.max.saturating_sub(self.value),
        }
    }

    pub fn available(&self) -> bool {
        match self.config.limit_type {
            LimitType::Always => false,
            LimitType::Never | LimitType::Loop => true,
            _ => self.config.max > self.value,
        }
    }

    /// Apply `delta`, clamped to the valid range; `expire` of 0 keeps
    /// the automatic boundary. Degenerate types never change.
    pub fn change(&mut self, delta: i32, expire: Timestamp) -> bool {
        let limit_type = self.config.limit_type;
        if matches!(limit_type, LimitType::Always | LimitType::Never) {
            return false;
        }

        let delta = if delta < 0 {
            -(delta.unsigned_abs().min(self.value) as i64)
        } else if delta > 0 {
            if limit_type == LimitType::Loop {
                // Wrap past max back into [start, max).
                let span = i64::from(self.config.max - self.config.start);
                let wrapped = i64::from(delta) % span;
                let mut next = i64::from(self.value) + wrapped;
                if next >= i64::from(self.config.max) {
                    next = next - i64::from(self.config.max) + i64::from(self.config.start);
                }
                next - i64::from(self.value)
            } else {
                i64::from((delta as u32).min(self.remain()))
            }
        } else {
            0
        };

        if delta == 0 && expire == 0 {
            return false;
        }

        self.value = (i64::from(self.value) + delta) as u32;
        if expire != 0 {
            self.set_expire(expire);
        } else {
            self.init_expire();
        }
        self.changed = true;
        true
    }

    /// Arm the reset boundary if none is armed yet.
    ///
    /// Periodic types expire at their next period start, capped by the
    /// optional duration; `None` uses the duration alone; degenerate
    /// types and `Loop` never expire.
    pub fn init_expire(&mut self) -> bool {
        if self.expire != 0 {
            return false;
        }

        let duration_cap = self
            .config
            .duration
            .map(|duration| now_ts() + duration)
            .unwrap_or(ETERNITY);

        let expire = match self.config.limit_type {
            LimitType::None => duration_cap,
            LimitType::Daily
            | LimitType::Weekly
            | LimitType::Monthly
            | LimitType::Yearly => next_boundary(self.config.limit_type).min(duration_cap),
            LimitType::Loop | LimitType::Always | LimitType::Never => ETERNITY,
        };

        self.set_expire(expire)
    }

    pub fn set_expire(&mut self, expire: Timestamp) -> bool {
        if self.expire == expire {
            return false;
        }
        self.expire = expire;
        self.changed = true;
        true
    }

    pub fn reset(&mut self) -> bool {
        if self.value == self.config.start && self.expire == 0 {
            return false;
        }
        self.value = self.config.start;
        self.expire = 0;
        self.changed = true;
        true
    }

    pub fn set_to_max(&mut self) -> bool {
        if self.value == self.config.max {
            return false;
        }
        self.value = self.config.max;
        self.changed = true;
        true
    }

    pub fn in_default_state(&self) -> bool {
        self.value == self.config.start && (self.expire == 0 || self.expire == ETERNITY)
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    pub fn serialize(&self) -> SObj {
        let mut data = SObj::new();
        data.emplace("id", self.id.as_str());
        if !self.clarifier.is_empty() {
            data.emplace("clarifier", self.clarifier.as_str());
        }
        data.emplace("value", self.value);
        if self.expire != 0 {
            data.emplace("expire", self.expire);
        }
        data
    }
}

/// Per-session set of limits, keyed by id plus clarifier.
#[derive(Debug)]
pub struct LimitContainer {
    manager: &'static LimitManager,
    limits: HashMap<(Id, String), Limit>,
    changed: bool,
}

impl Default for LimitContainer {
    fn default() -> Self {
        LimitContainer::new()
    }
}

impl LimitContainer {
    pub fn new() -> Self {
        LimitContainer::with_manager(limit_manager())
    }

    pub fn with_manager(manager: &'static LimitManager) -> Self {
        LimitContainer {
            manager,
            limits: HashMap::new(),
            changed: false,
        }
    }

    fn ensure(&mut self, id: &str, clarifier: &str) -> Result<&mut Limit> {
        match self
            .limits
            .entry((id.to_string(), clarifier.to_string()))
        {
            Entry::Occupied(entry) => {
                // An expired window resets before it is touched again.
                let limit = entry.into_mut();
                if limit.is_expired() {
                    limit.reset();
                }
                Ok(limit)
            }
            Entry::Vacant(entry) => {
                let limit = Limit::new(self.manager, id, clarifier)?;
                Ok(entry.insert(limit))
            }
        }
    }

    pub fn change(&mut self, id: &str, clarifier: &str, delta: i32) -> Result<bool> {
        let changed = self.ensure(id, clarifier)?.change(delta, 0);
        self.changed |= changed;
        Ok(changed)
    }

    pub fn available(&mut self, id: &str, clarifier: &str) -> Result<bool> {
        Ok(self.ensure(id, clarifier)?.available())
    }

    pub fn remain(&mut self, id: &str, clarifier: &str) -> Result<u32> {
        Ok(self.ensure(id, clarifier)?.remain())
    }

    pub fn reset(&mut self, id: &str, clarifier: &str) -> Result<bool> {
        let changed = self.ensure(id, clarifier)?.reset();
        self.changed |= changed;
        Ok(changed)
    }

    pub fn set_to_max(&mut self, id: &str, clarifier: &str) -> Result<bool> {
        let changed = self.ensure(id, clarifier)?.set_to_max();
        self.changed |= changed;
        Ok(changed)
    }

    pub fn get(&self, id: &str, clarifier: &str) -> Option<&Limit> {
        self.limits.get(&(id.to_string(), clarifier.to_string()))
    }

    /// Restore a stored limit without marking anything dirty.
    pub fn load(
        &mut self,
        id: &str,
        clarifier: &str,
        value: u32,
        expire: Timestamp,
    ) -> Result<()> {
        let mut limit = Limit::new(self.manager, id, clarifier)?;
        limit.value = value;
        limit.expire = expire;
        self.limits
            .insert((id.to_string(), clarifier.to_string()), limit);
        Ok(())
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_saved(&mut self) {
        self.changed = false;
        for limit in self.limits.values_mut() {
            limit.set_changed(false);
        }
    }

    /// Serialize every non-default limit.
    pub fn serialize(&self) -> SVal {
        let items: Vec<SVal> = self
            .limits
            .values()
            .filter(|limit| !limit.in_default_state())
            .map(|limit| SVal::Object(limit.serialize()))
            .collect();
        SVal::Array(items)
    }
}
