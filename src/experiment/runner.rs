//! Experiment replay.
//!
//! The runner plays the registry's role: it owns the address table, keeps
//! the experiment's address names mapped to handles and forwards every
//! scripted event to the solver.

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use super::environment::EvalEnvironment;
use super::report::{AddressReport, ExperimentReport, NetworkReport};
use super::types::{AddressRef, Episode, Experiment, Operation};
use crate::address::{Address, AddressId, AddressTable};
use crate::config::SolverConfig;
use crate::solver::AnySolver;
use crate::types::{NetworkType, PeerId, PropertyKind};

/// Load an experiment description from a YAML file
pub fn load_experiment(path: &Path) -> Result<Experiment> {
    info!("Loading experiment from: {:?}", path);

    let file = File::open(path)
        .wrap_err_with(|| format!("Failed to open experiment file {:?}", path))?;
    let experiment: Experiment = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse experiment file {:?}", path))?;

    if experiment.episodes.is_empty() {
        bail!("Experiment `{}' has no episodes", experiment.name);
    }
    Ok(experiment)
}

/// Replay `experiment` against a fresh solver built from `config`
pub fn run_experiment(
    config: &SolverConfig,
    experiment: &Experiment,
    seed: Option<u64>,
) -> Result<ExperimentReport> {
    let solver = AnySolver::from_config(config, EvalEnvironment::new(), seed)
        .wrap_err("Failed to set up solver")?;
    let mut runner = Runner {
        solver,
        addresses: AddressTable::new(),
        names: HashMap::new(),
    };

    info!(
        "Running experiment `{}' with {} episodes on the {:?} solver",
        experiment.name,
        experiment.episodes.len(),
        runner.solver.kind()
    );

    for (number, episode) in experiment.episodes.iter().enumerate() {
        runner
            .run_episode(episode)
            .wrap_err_with(|| {
                format!("Episode {} of experiment `{}' failed", number, experiment.name)
            })?;
    }

    let report = runner.report(experiment);
    runner.solver.solver_mut().done(&mut runner.addresses);
    Ok(report)
}

struct Runner {
    solver: AnySolver<EvalEnvironment>,
    addresses: AddressTable,
    /// Experiment address names and the network each one currently sits in
    names: HashMap<AddressRef, (AddressId, NetworkType)>,
}

impl Runner {
    fn run_episode(&mut self, episode: &Episode) -> Result<()> {
        if episode.bulk {
            self.solver.solver_mut().bulk_start();
        }
        for operation in &episode.operations {
            self.apply(operation)?;
        }
        if episode.bulk {
            self.solver.solver_mut().bulk_stop(&mut self.addresses);
        }
        if episode.steps > 0 {
            debug!("Running {} learning steps", episode.steps);
            self.solver.run_steps(&mut self.addresses, episode.steps);
        }
        Ok(())
    }

    fn lookup(&self, address: &AddressRef) -> Result<(AddressId, NetworkType)> {
        match self.names.get(address) {
            Some(entry) => Ok(*entry),
            None => bail!(
                "Unknown address `{}' ({}, session {}) of peer {}",
                address.address,
                address.plugin,
                address.session,
                address.peer
            ),
        }
    }

    fn apply(&mut self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::AddressAdd { address, network, delay, distance } => {
                if self.names.contains_key(address) {
                    bail!("Address `{}' of peer {} added twice", address.address, address.peer);
                }
                let id = self.addresses.insert(Address::new(
                    PeerId::from_index(address.peer),
                    &address.plugin,
                    address.address.as_bytes(),
                    address.session,
                ));
                let env = self.solver.callbacks_mut();
                env.set_property(id, PropertyKind::Delay, *delay);
                env.set_property(id, PropertyKind::Distance, *distance);
                self.names.insert(address.clone(), (id, *network));
                self.solver.solver_mut().address_add(&mut self.addresses, id, *network);
            }
            Operation::AddressDel { address, session_only } => {
                let (id, _) = self.lookup(address)?;
                self.solver
                    .solver_mut()
                    .address_delete(&mut self.addresses, id, *session_only);
                if !*session_only {
                    self.addresses.remove(id);
                    self.solver.callbacks_mut().forget_address(id);
                    self.names.remove(address);
                }
            }
            Operation::StartRequest { peer } => {
                let peer = PeerId::from_index(*peer);
                let suggested = self
                    .solver
                    .solver_mut()
                    .get_preferred_address(&mut self.addresses, &peer);
                match suggested {
                    Some(id) => {
                        info!("Suggested address {} for peer `{}'", id, peer);
                        // a fresh suggestion is not repeated for a short while
                        if let Some(address) = self.addresses.get_mut(id) {
                            address.block(Instant::now());
                        }
                    }
                    None => info!("No address to suggest for peer `{}'", peer),
                }
            }
            Operation::StopRequest { peer } => {
                let peer = PeerId::from_index(*peer);
                self.solver
                    .solver_mut()
                    .stop_get_preferred_address(&mut self.addresses, &peer);
            }
            Operation::SetPreference { peer, kind, value } => {
                let peer = PeerId::from_index(*peer);
                self.solver.callbacks_mut().set_preference(peer, *kind, *value);
                self.solver
                    .solver_mut()
                    .address_change_preference(&mut self.addresses, &peer, *kind, *value);
            }
            Operation::SetProperty { address, kind, value, abs_value } => {
                let (id, _) = self.lookup(address)?;
                self.solver.callbacks_mut().set_property(id, *kind, *value);
                self.solver.solver_mut().address_property_changed(
                    &mut self.addresses,
                    id,
                    *kind,
                    *abs_value,
                    *value,
                );
            }
            Operation::SetInUse { address, in_use } => {
                let (id, _) = self.lookup(address)?;
                if let Some(record) = self.addresses.get_mut(id) {
                    record.used = *in_use;
                }
                self.solver
                    .solver_mut()
                    .address_inuse_changed(&mut self.addresses, id, *in_use);
            }
            Operation::ChangeNetwork { address, network } => {
                let (id, current) = self.lookup(address)?;
                if current == *network {
                    warn!("Address {} already in network `{}'", id, network);
                }
                self.solver
                    .solver_mut()
                    .address_change_network(&mut self.addresses, id, current, *network);
                self.names.insert(address.clone(), (id, *network));
            }
        }
        Ok(())
    }

    fn report(&self, experiment: &Experiment) -> ExperimentReport {
        let mut addresses: Vec<AddressReport> = self
            .names
            .iter()
            .filter_map(|(name, (id, network))| {
                self.addresses.get(*id).map(|record| AddressReport {
                    peer: name.peer,
                    plugin: name.plugin.clone(),
                    address: name.address.clone(),
                    session: name.session,
                    network: *network,
                    active: record.active,
                    bw_in: record.assigned_bw_in,
                    bw_out: record.assigned_bw_out,
                })
            })
            .collect();
        addresses.sort_by(|a, b| {
            (a.peer, &a.address, a.session).cmp(&(b.peer, &b.address, b.session))
        });

        let networks = self
            .solver
            .quotas()
            .iter()
            .map(|entry| {
                let (assigned_in, assigned_out) = addresses
                    .iter()
                    .filter(|a| a.active && a.network == entry.network)
                    .fold((0u64, 0u64), |(bw_in, bw_out), a| {
                        (bw_in + u64::from(a.bw_in), bw_out + u64::from(a.bw_out))
                    });
                NetworkReport {
                    network: entry.network,
                    quota_in: entry.total_quota_in,
                    quota_out: entry.total_quota_out,
                    total_addresses: entry.total_addresses,
                    active_addresses: entry.active_addresses,
                    assigned_in,
                    assigned_out,
                }
            })
            .collect();

        let env = self.solver.callbacks();
        ExperimentReport {
            experiment: experiment.name.clone(),
            solver: self.solver.kind(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            episodes: experiment.episodes.len(),
            solve_passes: env.solve_passes(),
            learning_steps: self.solver.step_count(),
            notifications: env.notifications().to_vec(),
            networks,
            addresses,
        }
    }
}
