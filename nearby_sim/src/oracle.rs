//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated neighbourhood:
//! - True positions and status flags of every simulated peer
//! - A random-walk movement model around the viewer
//! - Telemetry generation (Gaussian position noise, optional malformed reports)

use nearby_env::{PeerId, PeerReport, Position, Timestamp};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::f64::consts::TAU;

/// Meters per degree of latitude.
const METERS_PER_DEG: f64 = 111_320.0;

/// A ground truth peer in the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPeer {
    pub id: PeerId,

    /// True position
    pub position: Position,

    /// Heading in radians (0 = north)
    pub heading_rad: f64,

    /// Walking/driving speed in m/s (0 = stationary)
    pub speed_mps: f64,

    pub online: bool,

    /// Still sharing location
    pub active: bool,
}

impl SimPeer {
    pub fn is_moving(&self) -> bool {
        self.speed_mps > 0.0
    }
}

/// Offsets `origin` by a metric displacement.
pub fn offset_position(origin: &Position, north_m: f64, east_m: f64) -> Position {
    let lat = origin.lat + north_m / METERS_PER_DEG;
    let cos_lat = origin.lat.to_radians().cos().max(1e-6);
    let lng = origin.lng + east_m / (METERS_PER_DEG * cos_lat);
    Position::new(lat.clamp(-89.9, 89.9), wrap_lng(lng))
}

fn wrap_lng(lng: f64) -> f64 {
    if lng > 180.0 {
        lng - 360.0
    } else if lng < -180.0 {
        lng + 360.0
    } else {
        lng
    }
}

/// The Oracle - maintains ground truth and generates telemetry.
pub struct PeerOracle {
    rng: ChaCha8Rng,

    /// Peers keyed by spawn order (deterministic iteration)
    peers: BTreeMap<u64, SimPeer>,

    next_id: u64,

    /// The viewer's own location
    viewer: Position,

    /// Position noise standard deviation (meters)
    position_noise_m: f64,

    /// Per-step probability of a peer flipping online status
    status_flip_prob: f64,
}

impl PeerOracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64, viewer: Position) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(physics_seed),
            peers: BTreeMap::new(),
            next_id: 0,
            viewer,
            position_noise_m: 0.0,
            status_flip_prob: 0.0,
        }
    }

    /// Sets the position noise standard deviation. Negative or non-finite
    /// values disable noise.
    pub fn set_position_noise(&mut self, std_dev_m: f64) {
        self.position_noise_m = if std_dev_m.is_finite() { std_dev_m.max(0.0) } else { 0.0 };
    }

    pub fn set_status_flip_probability(&mut self, p: f64) {
        self.status_flip_prob = p.clamp(0.0, 1.0);
    }

    pub fn viewer(&self) -> Position {
        self.viewer
    }

    /// Spawns one peer at `position`.
    pub fn spawn_peer(&mut self, position: Position, speed_mps: f64) -> PeerId {
        let key = self.next_id;
        self.next_id += 1;

        let id = PeerId::from_seed(key);
        let heading_rad = self.rng.gen_range(0.0..TAU);
        self.peers.insert(
            key,
            SimPeer {
                id,
                position,
                heading_rad,
                speed_mps,
                online: true,
                active: true,
            },
        );
        id
    }

    /// Spawns `count` peers uniformly over a disc of `radius_m` around `center`.
    /// About `moving_share` of them move.
    pub fn spawn_around(
        &mut self,
        center: Position,
        count: usize,
        radius_m: f64,
        moving_share: f64,
    ) -> Vec<PeerId> {
        let moving_share = moving_share.clamp(0.0, 1.0);
        (0..count)
            .map(|_| {
                // sqrt for uniform density over the disc
                let r = radius_m * self.rng.gen::<f64>().sqrt();
                let bearing = self.rng.gen_range(0.0..TAU);
                let position = offset_position(&center, r * bearing.cos(), r * bearing.sin());
                let speed = if self.rng.gen_bool(moving_share) {
                    self.rng.gen_range(0.5..15.0)
                } else {
                    0.0
                };
                self.spawn_peer(position, speed)
            })
            .collect()
    }

    /// Stops a peer from sharing. Returns false if it was not active.
    pub fn retire(&mut self, id: &PeerId) -> bool {
        match self.peers.values_mut().find(|p| p.id == *id && p.active) {
            Some(peer) => {
                peer.active = false;
                true
            }
            None => false,
        }
    }

    /// Advances the movement model by `dt_ms`.
    pub fn step(&mut self, dt_ms: i64) {
        let dt = dt_ms as f64 / 1000.0;
        let flip = self.status_flip_prob;

        for peer in self.peers.values_mut().filter(|p| p.active) {
            if peer.is_moving() {
                peer.heading_rad += self.rng.gen_range(-0.2..0.2);
                let d = peer.speed_mps * dt;
                peer.position = offset_position(
                    &peer.position,
                    d * peer.heading_rad.cos(),
                    d * peer.heading_rad.sin(),
                );
            }
            if flip > 0.0 && self.rng.gen_bool(flip) {
                peer.online = !peer.online;
            }
        }
    }

    fn noisy(&mut self, position: &Position) -> Position {
        let normal = match Normal::new(0.0, self.position_noise_m) {
            Ok(normal) if self.position_noise_m > 0.0 => normal,
            _ => return *position,
        };
        let north = normal.sample(&mut self.rng);
        let east = normal.sample(&mut self.rng);
        offset_position(position, north, east)
    }

    /// One report per active peer, stamped `now`.
    pub fn reports(&mut self, now: Timestamp) -> Vec<PeerReport> {
        let truth: Vec<SimPeer> = self.active_peers().cloned().collect();
        truth
            .iter()
            .map(|peer| {
                let position = self.noisy(&peer.position);
                PeerReport::new(peer.id, position, now)
                    .with_online(peer.online)
                    .with_moving(peer.is_moving())
                    .with_accuracy(self.position_noise_m.max(1.0))
            })
            .collect()
    }

    /// A report for a random active peer with a non-finite coordinate.
    pub fn malformed_report(&mut self, now: Timestamp) -> Option<PeerReport> {
        let ids: Vec<PeerId> = self.active_peers().map(|p| p.id).collect();
        if ids.is_empty() {
            return None;
        }
        let id = ids[self.rng.gen_range(0..ids.len())];
        Some(PeerReport::new(id, Position::new(f64::NAN, 0.0), now))
    }

    /// Picks up to `count` distinct active peers at random.
    pub fn pick_active(&mut self, count: usize) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.active_peers().map(|p| p.id).collect();
        let mut picked = Vec::new();
        while picked.len() < count && !ids.is_empty() {
            let index = self.rng.gen_range(0..ids.len());
            picked.push(ids.swap_remove(index));
        }
        picked
    }

    /// Uniform draw in [0, 1) from the physics RNG.
    pub fn roll(&mut self) -> f64 {
        self.rng.gen()
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &SimPeer> {
        self.peers.values().filter(|p| p.active)
    }

    pub fn active_count(&self) -> usize {
        self.active_peers().count()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&SimPeer> {
        self.peers.values().find(|p| p.id == *id)
    }
}
