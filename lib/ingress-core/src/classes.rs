//! IngressClass selection

use crate::config::ProviderConfig;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;

/// Pre-IngressClass way of naming the class
pub const LEGACY_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Marks the IngressClass adopted by Ingresses that name none
pub const DEFAULT_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

/// Decides which Ingresses this provider handles
#[derive(Debug)]
pub struct ClassFilter<'a> {
    config: &'a ProviderConfig,
    classes: HashSet<String>,
    has_default: bool,
}

impl<'a> ClassFilter<'a> {
    pub fn new(config: &'a ProviderConfig, ingress_classes: &[Arc<IngressClass>]) -> Self {
        let mut classes = HashSet::new();
        let mut has_default = false;

        for class in ingress_classes {
            let name = class.name_any();
            let controller = class
                .spec
                .as_ref()
                .and_then(|spec| spec.controller.as_deref())
                .unwrap_or_default();

            let handled = controller == config.controller_class
                || (config.ingress_class_by_name && name == config.ingress_class);
            if !handled {
                continue;
            }

            has_default |= class
                .annotations()
                .get(DEFAULT_CLASS_ANNOTATION)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            classes.insert(name);
        }

        Self {
            config,
            classes,
            has_default,
        }
    }

    pub fn accepts(&self, ingress: &Ingress) -> bool {
        let class_name = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.ingress_class_name.as_deref())
            .filter(|c| !c.is_empty());
        if let Some(class_name) = class_name {
            return self.classes.contains(class_name);
        }

        if let Some(legacy) = ingress.annotations().get(LEGACY_CLASS_ANNOTATION) {
            return *legacy == self.config.ingress_class || self.classes.contains(legacy);
        }

        self.config.watch_ingress_without_class || self.has_default
    }
}
