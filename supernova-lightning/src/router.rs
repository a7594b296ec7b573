// SuperNova Lightning Network - Path Finding
//
// Dijkstra search run backwards from the payee, so the amount each edge
// must carry (payment plus downstream fees) is known when the edge is
// examined.

use crate::channel::ShortChannelId;
use crate::graph::{ChannelPolicy, DirectedEdge, GraphData, GraphError, NodeId};
use crate::invoice::RouteHint;
use crate::wire::HopPayload;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Weight given to one block of CLTV delta, per msat carried, in 1e-9 units.
const CLTV_RISK_FACTOR: u128 = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No route found")]
    NoRouteFound,

    #[error("Every route exceeds the fee budget of {0} msat")]
    FeeBudgetExceeded(u64),

    #[error("Every route exceeds the CLTV budget of {0} blocks")]
    CltvBudgetExceeded(u32),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

/// One channel of a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHop {
    pub short_channel_id: ShortChannelId,
    pub from: NodeId,
    /// Node at the end of this channel
    pub node_id: NodeId,
    /// Amount carried by the HTLC over this channel
    pub amount_msat: u64,
    /// Fee charged by `from` for forwarding onto this channel
    pub fee_msat: u64,
    /// CLTV delta required by `from`
    pub cltv_expiry_delta: u16,
}

/// A route from the payer to the payee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hops: Vec<RouteHop>,
}

impl Route {
    /// Amount delivered to the payee
    pub fn amount_msat(&self) -> u64 {
        self.hops.last().map(|h| h.amount_msat).unwrap_or(0)
    }

    pub fn first_hop(&self) -> Option<&RouteHop> {
        self.hops.first()
    }

    pub fn total_amount_msat(&self) -> u64 {
        self.hops.first().map(|h| h.amount_msat).unwrap_or(0)
    }

    pub fn total_fee_msat(&self) -> u64 {
        self.hops.iter().map(|h| h.fee_msat).sum()
    }

    pub fn total_cltv_delta(&self) -> u32 {
        self.hops.iter().map(|h| u32::from(h.cltv_expiry_delta)).sum()
    }

    /// Absolute expiry of the HTLC over hop `index`.
    pub fn cltv_expiry_at(&self, index: usize, block_height: u32, min_final_cltv_expiry: u32) -> u32 {
        let downstream: u32 = self
            .hops
            .iter()
            .skip(index + 1)
            .map(|h| u32::from(h.cltv_expiry_delta))
            .sum();
        block_height
            .saturating_add(min_final_cltv_expiry)
            .saturating_add(downstream)
    }

    pub fn first_hop_cltv(&self, block_height: u32, min_final_cltv_expiry: u32) -> u32 {
        self.cltv_expiry_at(0, block_height, min_final_cltv_expiry)
    }

    /// Forwarding instructions carried by the first HTLC, one per
    /// downstream channel. Empty for a direct payment.
    pub fn hop_payloads(&self, block_height: u32, min_final_cltv_expiry: u32) -> Vec<HopPayload> {
        self.hops
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, hop)| HopPayload {
                short_channel_id: hop.short_channel_id,
                amount_to_forward: hop.amount_msat,
                outgoing_cltv_value: self.cltv_expiry_at(index, block_height, min_final_cltv_expiry),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Label {
    /// Amount that must arrive at this node
    amount_msat: u64,
    cost: u128,
    cltv: u32,
}

/// Route search over a graph snapshot plus private hint edges
pub struct PathFinder<'a> {
    graph: &'a GraphData,
    hint_edges: Vec<DirectedEdge>,
    excluded: HashSet<ShortChannelId>,
}

impl<'a> PathFinder<'a> {
    pub fn new(graph: &'a GraphData) -> Self {
        Self {
            graph,
            hint_edges: Vec::new(),
            excluded: HashSet::new(),
        }
    }

    /// Overlay invoice routing hints ending at `payee`.
    pub fn with_route_hints(mut self, hints: &[RouteHint], payee: NodeId) -> Self {
        for hint in hints {
            for (index, hop) in hint.0.iter().enumerate() {
                let to = hint
                    .0
                    .get(index + 1)
                    .map(|next| NodeId::new(next.node_id))
                    .unwrap_or(payee);
                self.hint_edges.push(DirectedEdge {
                    short_channel_id: hop.short_channel_id,
                    from: NodeId::new(hop.node_id),
                    to,
                    policy: ChannelPolicy {
                        fee_base_msat: hop.fee_base_msat,
                        fee_proportional_millionths: hop.fee_proportional_millionths,
                        cltv_expiry_delta: hop.cltv_expiry_delta,
                        htlc_minimum_msat: 0,
                        htlc_maximum_msat: u64::MAX,
                        disabled: false,
                        last_update: 0,
                    },
                });
            }
        }
        self
    }

    /// Skip these channels, e.g. after a failed attempt.
    pub fn excluding(mut self, channels: impl IntoIterator<Item = ShortChannelId>) -> Self {
        self.excluded.extend(channels);
        self
    }

    fn edges_into(&self, node: &NodeId) -> Vec<DirectedEdge> {
        let hinted: HashSet<ShortChannelId> =
            self.hint_edges.iter().map(|e| e.short_channel_id).collect();
        self.graph
            .edges_into(node)
            .into_iter()
            .filter(|e| !hinted.contains(&e.short_channel_id))
            .chain(self.hint_edges.iter().filter(|e| e.to == *node).copied())
            .filter(|e| !self.excluded.contains(&e.short_channel_id))
            .collect()
    }

    /// Cheapest route delivering `amount_msat` to `destination`.
    pub fn find_route(
        &self,
        source: NodeId,
        destination: NodeId,
        amount_msat: u64,
        max_fee_msat: u64,
        max_total_cltv_delta: u32,
    ) -> Result<Route, RoutingError> {
        if source == destination || amount_msat == 0 {
            return Err(RoutingError::NoRouteFound);
        }

        let mut labels: HashMap<NodeId, Label> = HashMap::new();
        let mut next_edge: HashMap<NodeId, DirectedEdge> = HashMap::new();
        let mut settled: HashSet<NodeId> = HashSet::new();
        let mut queue = BinaryHeap::new();
        let mut over_fee = false;
        let mut over_cltv = false;

        labels.insert(
            destination,
            Label {
                amount_msat,
                cost: 0,
                cltv: 0,
            },
        );
        queue.push(Reverse((0u128, 0u32, 0u64, destination)));

        while let Some(Reverse((_, _, _, node))) = queue.pop() {
            if !settled.insert(node) {
                continue;
            }
            if node == source {
                break;
            }
            let Some(label) = labels.get(&node).copied() else {
                continue;
            };

            for edge in self.edges_into(&node) {
                if settled.contains(&edge.from) || !edge.policy.accepts(label.amount_msat) {
                    continue;
                }

                // Our own channels cost nothing to use.
                let (fee, delta) = if edge.from == source {
                    (0, 0)
                } else {
                    (
                        edge.policy.fee_for(label.amount_msat),
                        u32::from(edge.policy.cltv_expiry_delta),
                    )
                };
                let Some(amount) = label.amount_msat.checked_add(fee) else {
                    continue;
                };
                if amount - amount_msat > max_fee_msat {
                    over_fee = true;
                    continue;
                }
                let cltv = label.cltv.saturating_add(delta);
                if cltv > max_total_cltv_delta {
                    over_cltv = true;
                    continue;
                }
                let risk = u128::from(delta) * u128::from(label.amount_msat) * CLTV_RISK_FACTOR
                    / 1_000_000_000;
                let cost = label.cost + u128::from(fee) + risk;

                let better = match labels.get(&edge.from) {
                    None => true,
                    Some(existing) => {
                        let current_scid = next_edge
                            .get(&edge.from)
                            .map(|e| e.short_channel_id.to_u64())
                            .unwrap_or(u64::MAX);
                        (cost, cltv, edge.short_channel_id.to_u64())
                            < (existing.cost, existing.cltv, current_scid)
                    }
                };
                if better {
                    labels.insert(
                        edge.from,
                        Label {
                            amount_msat: amount,
                            cost,
                            cltv,
                        },
                    );
                    next_edge.insert(edge.from, edge);
                    queue.push(Reverse((cost, cltv, edge.short_channel_id.to_u64(), edge.from)));
                }
            }
        }

        if !settled.contains(&source) {
            debug!(
                "No route from {} to {} for {} msat",
                source, destination, amount_msat
            );
            return Err(if over_fee {
                RoutingError::FeeBudgetExceeded(max_fee_msat)
            } else if over_cltv {
                RoutingError::CltvBudgetExceeded(max_total_cltv_delta)
            } else {
                RoutingError::NoRouteFound
            });
        }

        let mut hops = Vec::new();
        let mut node = source;
        while node != destination {
            let edge = next_edge.get(&node).ok_or(RoutingError::NoRouteFound)?;
            let carried = labels
                .get(&edge.to)
                .map(|l| l.amount_msat)
                .ok_or(RoutingError::NoRouteFound)?;
            let forwarding = edge.from != source;
            hops.push(RouteHop {
                short_channel_id: edge.short_channel_id,
                from: edge.from,
                node_id: edge.to,
                amount_msat: carried,
                fee_msat: 0,
                cltv_expiry_delta: 0,
            });
            if forwarding {
                if let Some(previous) = hops.len().checked_sub(2).and_then(|i| hops.get(i).cloned()) {
                    let index = hops.len() - 1;
                    hops[index].fee_msat = previous.amount_msat - carried;
                    hops[index].cltv_expiry_delta = edge.policy.cltv_expiry_delta;
                }
            }
            node = edge.to;
        }

        let route = Route { hops };
        debug!(
            "Found route of {} hops, fee {} msat, cltv delta {}",
            route.hops.len(),
            route.total_fee_msat(),
            route.total_cltv_delta()
        );
        Ok(route)
    }
}
