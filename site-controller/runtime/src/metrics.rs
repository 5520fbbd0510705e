use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ApiMetrics {
    redemptions: Family<RedemptionLabels, Counter>,
    policy_queries: Family<PolicyLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RedemptionLabels {
    outcome: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PolicyLabels {
    action: &'static str,
    allowed: &'static str,
}

// === impl ApiMetrics ===

impl ApiMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let redemptions = Family::<RedemptionLabels, Counter>::default();
        reg.register(
            "redemptions",
            "Total number of claim redemption requests by outcome",
            redemptions.clone(),
        );

        let policy_queries = Family::<PolicyLabels, Counter>::default();
        reg.register(
            "policy_queries",
            "Total number of cluster policy queries by action and result",
            policy_queries.clone(),
        );

        Self {
            redemptions,
            policy_queries,
        }
    }

    pub(crate) fn redeemed(&self, outcome: &'static str) {
        self.redemptions
            .get_or_create(&RedemptionLabels { outcome })
            .inc();
    }

    pub(crate) fn policy_queried(&self, action: &'static str, allowed: bool) {
        self.policy_queries
            .get_or_create(&PolicyLabels {
                action,
                allowed: if allowed { "true" } else { "false" },
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn redemption_count(&self, outcome: &'static str) -> u64 {
        self.redemptions
            .get_or_create(&RedemptionLabels { outcome })
            .get()
    }
}
