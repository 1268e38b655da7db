//! End-to-end behaviour of both solvers driven through the public API.

use std::collections::HashMap;

use ats_solver::solver::ril::{FEATURES_PER_ADDRESS, FEATURES_PER_NETWORK, META_ACTION_COUNT};
use ats_solver::{
    Address, AddressId, AddressTable, NetworkType, PeerId, PreferenceKind, ProportionalSolver,
    QuotaTable, RilConfig, RilSolver, Solver, SolverCallbacks, SolverOperation, SolverScope, MIN_BW,
};

#[derive(Default)]
struct Registry {
    changes: Vec<(AddressId, bool, u32, u32)>,
    preferences: HashMap<PeerId, [f64; 2]>,
    properties: HashMap<AddressId, [f64; 2]>,
    solve_passes: u32,
}

impl Registry {
    fn changes_for(&self, id: AddressId) -> Vec<(bool, u32, u32)> {
        self.changes
            .iter()
            .filter(|(changed, ..)| *changed == id)
            .map(|(_, active, bw_in, bw_out)| (*active, *bw_in, *bw_out))
            .collect()
    }
}

impl SolverCallbacks for Registry {
    fn bandwidth_changed(&mut self, id: AddressId, address: &Address) {
        self.changes
            .push((id, address.active, address.assigned_bw_in, address.assigned_bw_out));
    }

    fn preferences(&self, peer: &PeerId) -> Option<[f64; 2]> {
        self.preferences.get(peer).copied()
    }

    fn properties(&self, id: AddressId, _address: &Address) -> [f64; 2] {
        self.properties.get(&id).copied().unwrap_or([0.5, 0.5])
    }

    fn solver_info(&mut self, operation: SolverOperation, _scope: SolverScope) {
        if operation == SolverOperation::SolveStart {
            self.solve_passes += 1;
        }
    }
}

fn proportional(quota: u64) -> ProportionalSolver<Registry> {
    ProportionalSolver::new(Registry::default(), &[NetworkType::Lan], &[quota], &[quota]).unwrap()
}

fn insert(table: &mut AddressTable, peer: u64, addr: &str) -> AddressId {
    table.insert(Address::new(PeerId::from_index(peer), "tcp", addr.as_bytes(), 0))
}

/// Quiescent-state invariants shared by every scenario
fn assert_invariants(table: &AddressTable, quotas: &QuotaTable) {
    for peer in table.peers() {
        let active = table
            .peer_addresses(&peer)
            .into_iter()
            .filter(|id| table.get(*id).map_or(false, |a| a.active))
            .count();
        assert!(active <= 1, "peer {} has {} active addresses", peer, active);
    }
    for entry in quotas.iter() {
        let floor = u64::from(entry.active_addresses) * u64::from(MIN_BW);
        assert!(floor <= entry.total_quota_in);
        assert!(floor <= entry.total_quota_out);
    }
}

fn assigned_total(table: &AddressTable) -> (u64, u64) {
    table
        .iter()
        .filter(|(_, a)| a.active)
        .fold((0, 0), |(i, o), (_, a)| {
            (i + u64::from(a.assigned_bw_in), o + u64::from(a.assigned_bw_out))
        })
}

#[test]
fn test_three_peers_share_network_equally() {
    let mut table = AddressTable::new();
    let mut solver = proportional(100_000);
    let ids: Vec<AddressId> = (1..=3)
        .map(|peer| {
            let id = insert(&mut table, peer, &format!("10.0.0.{}:2086", peer));
            solver.address_add(&mut table, id, NetworkType::Lan);
            id
        })
        .collect();

    for peer in 1..=3 {
        assert!(solver
            .get_preferred_address(&mut table, &PeerId::from_index(peer))
            .is_some());
    }

    let expected = 1024 + (100_000 - 3 * 1024) / 3;
    for id in &ids {
        let address = table.get(*id).unwrap();
        assert!(address.active);
        assert_eq!(address.assigned_bw_in, expected);
        assert_eq!(address.assigned_bw_out, expected);
    }
    let (bw_in, bw_out) = assigned_total(&table);
    assert!(bw_in <= 100_000 + 1 && bw_out <= 100_000 + 1);
    assert_eq!(solver.quotas().get(NetworkType::Lan).unwrap().active_addresses, 3);
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_funded_address_outranks_closer_one() {
    let mut table = AddressTable::new();
    let mut solver = proportional(100_000);
    let peer = PeerId::from_index(1);
    let first = insert(&mut table, 1, "10.0.0.1:2086");
    let second = insert(&mut table, 1, "10.0.0.2:2086");
    solver.callbacks_mut().properties.insert(first, [0.5, 0.5]);
    solver.callbacks_mut().properties.insert(second, [0.5, 0.6]);
    solver.address_add(&mut table, first, NetworkType::Lan);
    solver.address_add(&mut table, second, NetworkType::Lan);

    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(first));
    assert!(table.get(first).unwrap().assigned_bw_in > 0);

    let closer = insert(&mut table, 1, "10.0.0.3:2086");
    solver.callbacks_mut().properties.insert(closer, [0.5, 0.1]);
    solver.address_add(&mut table, closer, NetworkType::Lan);

    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(first));
    assert!(!table.get(closer).unwrap().active);
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_repeated_suggestion_is_idempotent() {
    let mut table = AddressTable::new();
    let mut solver = proportional(100_000);
    let peer = PeerId::from_index(1);
    let id = insert(&mut table, 1, "10.0.0.1:2086");
    solver.address_add(&mut table, id, NetworkType::Lan);

    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(id));
    let notifications = solver.callbacks().changes.len();
    let passes = solver.callbacks().solve_passes;

    for _ in 0..3 {
        assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(id));
    }
    assert_eq!(solver.callbacks().changes.len(), notifications);
    assert_eq!(solver.callbacks().solve_passes, passes);
}

#[test]
fn test_delete_active_switches_to_alternative() {
    let mut table = AddressTable::new();
    let mut solver = proportional(100_000);
    let peer = PeerId::from_index(1);
    let first = insert(&mut table, 1, "10.0.0.1:2086");
    let second = insert(&mut table, 1, "10.0.0.2:2086");
    solver.callbacks_mut().properties.insert(second, [0.9, 0.9]);
    solver.address_add(&mut table, first, NetworkType::Lan);
    solver.address_add(&mut table, second, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(first));

    solver.address_delete(&mut table, first, false);
    table.remove(first);

    let replacement = table.get(second).unwrap();
    assert!(replacement.active);
    assert_eq!(replacement.assigned_bw_in, 100_000);
    assert_eq!(solver.callbacks().changes_for(second), vec![(true, 100_000, 100_000)]);
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_delete_last_address_disconnects_once() {
    let mut table = AddressTable::new();
    let mut solver = proportional(100_000);
    let peer = PeerId::from_index(1);
    let only = insert(&mut table, 1, "10.0.0.1:2086");
    solver.address_add(&mut table, only, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(only));
    assert!(solver.callbacks().changes.is_empty());

    solver.address_delete(&mut table, only, false);

    assert_eq!(solver.callbacks().changes_for(only), vec![(false, 0, 0)]);
    assert!(table.get(only).unwrap().solver_information.is_none());
    let lan = solver.quotas().get(NetworkType::Lan).unwrap();
    assert_eq!(lan.total_addresses, 0);
    assert_eq!(lan.active_addresses, 0);
}

#[test]
fn test_network_without_headroom_suggests_nothing() {
    let mut table = AddressTable::new();
    let mut solver = proportional(2_000);
    let a = insert(&mut table, 1, "10.0.0.1:2086");
    let b = insert(&mut table, 2, "10.0.0.2:2086");
    solver.address_add(&mut table, a, NetworkType::Lan);
    solver.address_add(&mut table, b, NetworkType::Lan);

    assert_eq!(solver.get_preferred_address(&mut table, &PeerId::from_index(1)), Some(a));
    // 2000 / 2 is not above MIN_BW
    assert_eq!(solver.get_preferred_address(&mut table, &PeerId::from_index(2)), None);
    assert!(!table.get(b).unwrap().active);
    assert_invariants(&table, solver.quotas());
}

/// Five adds, two deletes and three preference changes on five requesting peers
fn batch(solver: &mut ProportionalSolver<Registry>, table: &mut AddressTable) -> Vec<AddressId> {
    let ids: Vec<AddressId> = (1..=5)
        .map(|peer| {
            let id = insert(table, peer, &format!("10.0.1.{}:2086", peer));
            solver.address_add(table, id, NetworkType::Lan);
            id
        })
        .collect();
    for id in &ids[..2] {
        solver.address_delete(table, *id, false);
        table.remove(*id);
    }
    for (peer, value) in [(3, 2.0), (4, 3.0), (5, 0.5)] {
        let peer = PeerId::from_index(peer);
        solver.callbacks_mut().preferences.insert(peer, [value, value]);
        solver.address_change_preference(table, &peer, PreferenceKind::Bandwidth, value);
    }
    ids[2..].to_vec()
}

#[test]
fn test_bulk_batch_matches_unbatched_run() {
    let mut plain_table = AddressTable::new();
    let mut plain = proportional(200_000);
    let mut bulk_table = AddressTable::new();
    let mut bulk = proportional(200_000);
    for peer in 1..=5 {
        let peer = PeerId::from_index(peer);
        assert_eq!(plain.get_preferred_address(&mut plain_table, &peer), None);
        assert_eq!(bulk.get_preferred_address(&mut bulk_table, &peer), None);
    }

    let plain_ids = batch(&mut plain, &mut plain_table);

    let passes_before = bulk.callbacks().solve_passes;
    bulk.bulk_start();
    let bulk_ids = batch(&mut bulk, &mut bulk_table);
    assert_eq!(bulk.callbacks().solve_passes, passes_before);
    bulk.bulk_stop(&mut bulk_table);
    assert_eq!(bulk.callbacks().solve_passes, passes_before + 1);

    for (plain_id, bulk_id) in plain_ids.iter().zip(&bulk_ids) {
        let expected = plain_table.get(*plain_id).unwrap();
        let actual = bulk_table.get(*bulk_id).unwrap();
        assert!(actual.active);
        assert_eq!(actual.assigned_bw_in, expected.assigned_bw_in);
        assert_eq!(actual.assigned_bw_out, expected.assigned_bw_out);
    }
    assert_invariants(&bulk_table, bulk.quotas());
}

#[test]
fn test_nested_bulk_runs_once_at_outermost_unlock() {
    let mut table = AddressTable::new();
    let mut solver = proportional(100_000);
    let peer = PeerId::from_index(1);
    solver.get_preferred_address(&mut table, &peer);
    let passes = solver.callbacks().solve_passes;

    solver.bulk_start();
    solver.bulk_start();
    let id = insert(&mut table, 1, "10.0.0.1:2086");
    solver.address_add(&mut table, id, NetworkType::Lan);
    solver.bulk_stop(&mut table);
    assert_eq!(solver.callbacks().solve_passes, passes);
    solver.bulk_stop(&mut table);
    assert_eq!(solver.callbacks().solve_passes, passes + 1);
    assert_eq!(table.get(id).unwrap().assigned_bw_in, 100_000);
}

/// Request peer 1, then add a far and a closer address and change its preference
fn late_addresses(
    solver: &mut ProportionalSolver<Registry>,
    table: &mut AddressTable,
) -> (AddressId, AddressId) {
    let peer = PeerId::from_index(1);
    let far = insert(table, 1, "10.0.2.1:2086");
    let near = insert(table, 1, "10.0.2.2:2086");
    solver.callbacks_mut().properties.insert(far, [0.5, 0.5]);
    solver.callbacks_mut().properties.insert(near, [0.5, 0.1]);
    solver.address_add(table, far, NetworkType::Lan);
    solver.address_add(table, near, NetworkType::Lan);
    solver.callbacks_mut().preferences.insert(peer, [2.0, 2.0]);
    solver.address_change_preference(table, &peer, PreferenceKind::Latency, 2.0);
    (far, near)
}

#[test]
fn test_bulk_keeps_address_activated_inside_batch() {
    let peer = PeerId::from_index(1);
    let mut plain_table = AddressTable::new();
    let mut plain = proportional(100_000);
    assert_eq!(plain.get_preferred_address(&mut plain_table, &peer), None);
    let (plain_far, plain_near) = late_addresses(&mut plain, &mut plain_table);
    assert!(plain_table.get(plain_far).unwrap().active);
    assert!(!plain_table.get(plain_near).unwrap().active);

    let mut bulk_table = AddressTable::new();
    let mut bulk = proportional(100_000);
    assert_eq!(bulk.get_preferred_address(&mut bulk_table, &peer), None);
    bulk.bulk_start();
    let (bulk_far, bulk_near) = late_addresses(&mut bulk, &mut bulk_table);
    bulk.bulk_stop(&mut bulk_table);

    let far = bulk_table.get(bulk_far).unwrap();
    assert!(far.active);
    assert_eq!(far.assigned_bw_in, plain_table.get(plain_far).unwrap().assigned_bw_in);
    assert!(!bulk_table.get(bulk_near).unwrap().active);
    assert_invariants(&bulk_table, bulk.quotas());
}

fn ril(networks: &[NetworkType]) -> RilSolver<Registry> {
    let quotas = vec![1_000_000; networks.len()];
    RilSolver::new(Registry::default(), networks, &quotas, &quotas, RilConfig::default())
        .unwrap()
        .with_seed(7)
}

fn ril_lan(quota: u64, params: RilConfig) -> RilSolver<Registry> {
    RilSolver::new(Registry::default(), &[NetworkType::Lan], &[quota], &[quota], params)
        .unwrap()
        .with_seed(7)
}

#[test]
fn test_ril_agent_grows_and_keeps_learned_block() {
    let networks = NetworkType::ALL;
    let mut table = AddressTable::new();
    let mut solver = ril(&networks);
    let peer = PeerId::from_index(1);

    let mut ids = Vec::new();
    for k in 0..3 {
        let id = insert(&mut table, 1, &format!("10.0.0.{}:2086", k));
        solver.address_add(&mut table, id, NetworkType::Lan);
        ids.push(id);
    }
    let agent = solver.agent_mut(&peer).unwrap();
    assert_eq!((agent.n(), agent.m()), (12, 35));

    let (rows, cols) = (agent.n(), agent.m());
    for row in 0..rows {
        for col in 0..cols {
            agent.weights_mut().set(row, col, (row * 100 + col) as f64);
        }
    }

    let fourth = insert(&mut table, 1, "10.0.0.3:2086");
    solver.address_add(&mut table, fourth, NetworkType::Wan);

    let agent = solver.agent(&peer).unwrap();
    assert_eq!(agent.n(), META_ACTION_COUNT + 4);
    assert_eq!(agent.m(), FEATURES_PER_NETWORK * networks.len() + FEATURES_PER_ADDRESS * 4);
    let weights = agent.weights();
    assert_eq!(weights.rows(), 13);
    assert_eq!(weights.cols(), 40);
    for row in 0..rows {
        for col in 0..cols {
            assert_eq!(weights.get(row, col), Some((row * 100 + col) as f64));
        }
    }
    for col in 0..40 {
        assert_eq!(weights.get(12, col), Some(0.0));
    }
    for row in 0..13 {
        for col in 35..40 {
            assert_eq!(weights.get(row, col), Some(0.0));
        }
    }
}

#[test]
fn test_ril_dimensions_follow_add_delete_sequence() {
    let networks = [NetworkType::Lan, NetworkType::Wan];
    let mut table = AddressTable::new();
    let mut solver = ril(&networks);
    let peer = PeerId::from_index(1);

    let a = insert(&mut table, 1, "a");
    let b = insert(&mut table, 1, "b");
    let c = insert(&mut table, 1, "c");
    for id in [a, b, c] {
        solver.address_add(&mut table, id, NetworkType::Lan);
    }
    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(a));

    solver.address_delete(&mut table, b, false);
    table.remove(b);
    let agent = solver.agent(&peer).unwrap();
    assert_eq!((agent.n(), agent.m()), (11, 18));
    assert_eq!(agent.weights().rows(), agent.n());
    assert_eq!(agent.weights().cols(), agent.m());
    assert_eq!(agent.addresses(), &[a, c]);

    for _ in 0..5 {
        solver.step(&mut table);
    }
    let agent = solver.agent(&peer).unwrap();
    assert_eq!(agent.weights().rows(), agent.n());
    assert_eq!(agent.weights().cols(), agent.m());
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_ril_delete_in_use_moves_to_alternative() {
    let networks = [NetworkType::Lan];
    let mut table = AddressTable::new();
    let mut solver = ril(&networks);
    let peer = PeerId::from_index(1);

    let a = insert(&mut table, 1, "a");
    let b = insert(&mut table, 1, "b");
    solver.address_add(&mut table, a, NetworkType::Lan);
    solver.address_add(&mut table, b, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(a));

    solver.address_delete(&mut table, a, false);
    table.remove(a);

    assert_eq!(solver.agent(&peer).unwrap().address_inuse, Some(b));
    assert!(table.get(b).unwrap().active);
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_ril_activation_respects_minimum_bandwidth() {
    let mut table = AddressTable::new();
    let mut solver = ril_lan(2_500, RilConfig::default());
    for peer in 1..=5 {
        let id = insert(&mut table, peer, &format!("10.0.3.{}:2086", peer));
        solver.address_add(&mut table, id, NetworkType::Lan);
    }

    let suggested = (1..=5)
        .filter_map(|peer| solver.get_preferred_address(&mut table, &PeerId::from_index(peer)))
        .count();
    // 2500 / 3 is not above MIN_BW
    assert_eq!(suggested, 2);
    assert_eq!(solver.quotas().get(NetworkType::Lan).unwrap().active_addresses, 2);
    assert_invariants(&table, solver.quotas());

    for _ in 0..20 {
        solver.step(&mut table);
        assert_invariants(&table, solver.quotas());
        let (bw_in, bw_out) = assigned_total(&table);
        assert!(bw_in <= 2_500 && bw_out <= 2_500);
    }
}

#[test]
fn test_ril_bandwidth_stays_within_quota() {
    let params = RilConfig {
        explore_ratio: 1.0,
        ..RilConfig::default()
    };
    let mut table = AddressTable::new();
    let mut solver = ril_lan(4_096, params);
    let first = insert(&mut table, 1, "10.0.4.1:2086");
    solver.address_add(&mut table, first, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &PeerId::from_index(1)), Some(first));

    for _ in 0..500 {
        solver.step(&mut table);
        let address = table.get(first).unwrap();
        assert!(address.assigned_bw_in >= MIN_BW && address.assigned_bw_in <= 4_096);
        assert!(address.assigned_bw_out >= MIN_BW && address.assigned_bw_out <= 4_096);
    }

    // a later peer gets its minimum out of the share of the first one
    let second = insert(&mut table, 2, "10.0.4.2:2086");
    solver.address_add(&mut table, second, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &PeerId::from_index(2)), Some(second));
    for _ in 0..100 {
        let (bw_in, bw_out) = assigned_total(&table);
        assert!(bw_in <= 4_096 && bw_out <= 4_096);
        solver.step(&mut table);
    }
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_ril_unknown_network_reports_removed_address() {
    let mut table = AddressTable::new();
    let mut solver = ril(&[NetworkType::Lan]);
    let peer = PeerId::from_index(1);
    let a = insert(&mut table, 1, "a");
    let b = insert(&mut table, 1, "b");
    solver.address_add(&mut table, a, NetworkType::Lan);
    solver.address_add(&mut table, b, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(a));

    solver.address_change_network(&mut table, a, NetworkType::Lan, NetworkType::Wlan);

    assert_eq!(solver.callbacks().changes_for(a), vec![(false, 0, 0)]);
    assert_eq!(solver.callbacks().changes_for(b), vec![(true, MIN_BW, MIN_BW)]);
    assert_eq!(solver.agent(&peer).unwrap().address_inuse, Some(b));
    assert_invariants(&table, solver.quotas());
}

#[test]
fn test_ril_unknown_network_disconnects_once() {
    let mut table = AddressTable::new();
    let mut solver = ril(&[NetworkType::Lan]);
    let peer = PeerId::from_index(1);
    let only = insert(&mut table, 1, "a");
    solver.address_add(&mut table, only, NetworkType::Lan);
    assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(only));

    solver.address_change_network(&mut table, only, NetworkType::Lan, NetworkType::Wlan);

    assert_eq!(solver.callbacks().changes_for(only), vec![(false, 0, 0)]);
    assert_eq!(solver.agent(&peer).unwrap().address_inuse, None);
}
