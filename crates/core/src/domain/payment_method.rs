use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentMethodId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: PaymentMethodId,
    pub name: String,
    pub active: bool,
}

/// Active methods ordered by name, the way pickers list them.
pub fn active_sorted(methods: &[PaymentMethod]) -> Vec<&PaymentMethod> {
    let mut active: Vec<&PaymentMethod> = methods.iter().filter(|method| method.active).collect();
    active.sort_by(|left, right| left.name.cmp(&right.name));
    active
}

#[cfg(test)]
mod tests {
    use super::{active_sorted, PaymentMethod, PaymentMethodId};

    #[test]
    fn lists_only_active_methods_by_name() {
        let methods = vec![
            PaymentMethod { id: PaymentMethodId("pm-3".into()), name: "Wire".into(), active: true },
            PaymentMethod { id: PaymentMethodId("pm-1".into()), name: "Cash".into(), active: false },
            PaymentMethod { id: PaymentMethodId("pm-2".into()), name: "Card".into(), active: true },
        ];

        let names: Vec<&str> = active_sorted(&methods).iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Card", "Wire"]);
    }
}
