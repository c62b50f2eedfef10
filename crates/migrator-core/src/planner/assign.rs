//! Greedy least-loaded assignment of customers to instances.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::CustomerAssignment;

/// A customer with its owned spaces and counted uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerLoad {
    pub customer: String,
    pub spaces: Vec<String>,
    pub upload_count: u64,
}

/// Cumulative load of one instance after assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLoad {
    pub instance_id: u32,
    pub customers: u64,
    pub uploads: u64,
}

/// Assign every customer to exactly one of `instances` instances.
///
/// Customers are taken heaviest first (ties by identifier, so the result is
/// deterministic) and each goes to the instance with the lowest cumulative
/// upload count, lowest index on ties. For any input the final spread
/// `max(load) - min(load)` is at most the heaviest single customer.
pub fn assign_customers(
    loads: &[CustomerLoad],
    instances: u32,
) -> (Vec<CustomerAssignment>, Vec<InstanceLoad>) {
    let instances = instances.max(1);
    let mut totals: Vec<InstanceLoad> = (0..instances)
        .map(|instance_id| InstanceLoad {
            instance_id,
            ..Default::default()
        })
        .collect();

    let mut ordered: Vec<&CustomerLoad> = loads.iter().collect();
    ordered.sort_by(|a, b| match b.upload_count.cmp(&a.upload_count) {
        Ordering::Equal => a.customer.cmp(&b.customer),
        other => other,
    });

    let mut assignments = Vec::with_capacity(ordered.len());
    for load in ordered {
        let target = totals
            .iter_mut()
            .min_by_key(|t| (t.uploads, t.instance_id))
            .map(|t| {
                t.uploads += load.upload_count;
                t.customers += 1;
                t.instance_id
            })
            .unwrap_or(0);

        assignments.push(CustomerAssignment {
            customer: load.customer.clone(),
            instance_id: target,
            spaces: load.spaces.clone(),
            upload_count: load.upload_count,
        });
    }

    (assignments, totals)
}
