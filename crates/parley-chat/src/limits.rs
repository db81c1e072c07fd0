use chrono::{DateTime, Utc};

use parley_types::models::{Customer, Tier};

/// Credit ceilings per tier.
#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    pub anonymous: i64,
    pub free: i64,
    pub pro: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            anonymous: 10,
            free: 50,
            pro: 1500,
        }
    }
}

impl LimitsConfig {
    pub fn for_tier(&self, tier: Tier) -> Limits {
        let credits = match tier {
            Tier::Anonymous => self.anonymous,
            Tier::Free => self.free,
            Tier::Pro => self.pro,
        };
        Limits { tier, credits }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub tier: Tier,
    pub credits: i64,
}

/// A subscription counts only while its end is strictly in the future.
pub fn is_pro(subscription_ends_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    subscription_ends_at.is_some_and(|ends_at| ends_at > now)
}

pub fn select_limits(is_pro: bool, is_anonymous: bool, config: &LimitsConfig) -> Limits {
    let tier = match (is_pro, is_anonymous) {
        (true, false) => Tier::Pro,
        (false, false) => Tier::Free,
        // Anonymous sessions cannot hold a subscription; the pro case is
        // unreachable and falls to the most restrictive tier.
        (_, true) => Tier::Anonymous,
    };
    config.for_tier(tier)
}

pub fn limits_for(
    customer: Option<&Customer>,
    is_anonymous: bool,
    now: DateTime<Utc>,
    config: &LimitsConfig,
) -> Limits {
    let pro = is_pro(customer.and_then(|c| c.subscription_ends_at), now);
    select_limits(pro, is_anonymous, config)
}

/// Credits left after paying `cost`. Negative means the request is over quota.
pub fn remaining_credits(limits: &Limits, used: i64, cost: i64) -> i64 {
    limits.credits - used - cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pro_requires_future_end() {
        let now = Utc::now();
        assert!(!is_pro(None, now));
        assert!(!is_pro(Some(now), now));
        assert!(!is_pro(Some(now - Duration::seconds(1)), now));
        assert!(is_pro(Some(now + Duration::seconds(1)), now));
    }

    #[test]
    fn tier_table() {
        let config = LimitsConfig::default();
        assert_eq!(select_limits(true, false, &config).tier, Tier::Pro);
        assert_eq!(select_limits(false, false, &config).tier, Tier::Free);
        assert_eq!(select_limits(false, true, &config).tier, Tier::Anonymous);
        assert_eq!(select_limits(true, true, &config).tier, Tier::Anonymous);
    }

    #[test]
    fn expired_subscription_is_never_pro() {
        let now = Utc::now();
        let config = LimitsConfig::default();
        let customer = Customer {
            user_id: uuid::Uuid::new_v4(),
            customer_id: "cus_1".into(),
            subscription_ends_at: Some(now - Duration::days(1)),
        };

        assert_eq!(limits_for(Some(&customer), false, now, &config).tier, Tier::Free);
        assert_eq!(limits_for(Some(&customer), true, now, &config).tier, Tier::Anonymous);
        assert_eq!(limits_for(None, false, now, &config).credits, 50);
    }

    #[test]
    fn remaining_credit_boundary() {
        let limits = LimitsConfig::default().for_tier(Tier::Anonymous);
        assert_eq!(remaining_credits(&limits, 5, 5), 0);
        assert_eq!(remaining_credits(&limits, 6, 5), -1);
    }
}
