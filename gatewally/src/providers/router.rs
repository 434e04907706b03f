// gatewally/src/providers/router.rs
//
// Weighted A/B routing across provider/model variants.
//
// A uniform sample r ∈ [0, 100) picks the first variant whose cumulative
// percentage reaches it. Misconfigured or disabled routing falls back to
// the system default route.

use rand::Rng;

use crate::config::{AbTestingConfig, AbVariant};

pub struct AbRouter {
    enabled:          bool,
    variants:         Vec<AbVariant>,
    default_provider: String,
    default_model:    String,
}

impl AbRouter {
    pub fn new(config: &AbTestingConfig, default_route: (String, String)) -> Self {
        Self {
            enabled:          config.enabled,
            variants:         config.variants.clone(),
            default_provider: default_route.0,
            default_model:    default_route.1,
        }
    }

    pub fn route(&self) -> (String, String) {
        if !self.enabled || self.variants.is_empty() {
            return (self.default_provider.clone(), self.default_model.clone());
        }

        let r: f64 = rand::thread_rng().gen::<f64>() * 100.0;
        match pick(&self.variants, r) {
            Some(variant) => (variant.provider.clone(), variant.model.clone()),
            None => (self.default_provider.clone(), self.default_model.clone()),
        }
    }
}

/// Pure cumulative pick: the first variant whose running percentage total
/// reaches `r`. Weights summing below 100 leave a dead zone that falls
/// back to the first variant, mirroring a misconfigured rollout.
fn pick(variants: &[AbVariant], r: f64) -> Option<&AbVariant> {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.percentage;
        if r <= cumulative {
            return Some(variant);
        }
    }
    variants.first()
}
