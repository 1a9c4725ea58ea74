//! Synthetic host: random-walking entities and observers in one region.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rgb_track::prelude::*;
use rgb_track::{HostError, TrackAction};

/// A square region of the world whose contents wander every tick.
pub struct SyntheticWorld {
    rng: StdRng,
    frame: HostFrame,
    extent: f64,
    next_id: u64,
}

impl SyntheticWorld {
    pub fn new(seed: u64, entities: usize, observers: usize, extent: f64) -> Self {
        let mut world = Self {
            rng: StdRng::seed_from_u64(seed),
            frame: HostFrame::default(),
            extent,
            next_id: 0,
        };

        for _ in 0..entities {
            let entity = world.spawn();
            world.frame.entities.push(entity);
        }

        for i in 0..observers {
            let position = world.random_position();
            let mut observer = ObserverRecord::new(ObserverId(i as u64), position, 48.0);

            // Players are entities too; the observer must not track itself
            let mut body = world.spawn();
            body.position = position;
            body.category = EntityCategory::Player;
            observer.self_entity = Some(body.id);
            world.frame.entities.push(body);
            world.frame.observers.push(observer);
        }

        world
    }

    /// Advance one tick: move everything, despawn a few, spawn replacements.
    pub fn step(&mut self) {
        let extent = self.extent;

        for entity in &mut self.frame.entities {
            let step = if entity.category == EntityCategory::Projectile {
                3.0
            } else {
                0.4
            };
            entity.position.x = (entity.position.x + self.rng.gen_range(-step..step)).clamp(-extent, extent);
            entity.position.z = (entity.position.z + self.rng.gen_range(-step..step)).clamp(-extent, extent);
            if self.rng.gen_bool(0.2) {
                entity.rotation.yaw = self.rng.gen_range(0.0..360.0);
            }
            if self.rng.gen_bool(0.01) {
                entity.revision += 1;
            }
        }

        for observer in &mut self.frame.observers {
            observer.position.x = (observer.position.x + self.rng.gen_range(-0.6..0.6)).clamp(-extent, extent);
            observer.position.z = (observer.position.z + self.rng.gen_range(-0.6..0.6)).clamp(-extent, extent);

            let (id, position) = (observer.self_entity, observer.position);
            if let Some(body) = self.frame.entities.iter_mut().find(|e| Some(e.id) == id) {
                body.position = position;
            }
        }

        let churn = self.frame.entities.len() / 200 + 1;
        for _ in 0..churn {
            let victim = self.rng.gen_range(0..self.frame.entities.len().max(1));
            if self
                .frame
                .entities
                .get(victim)
                .is_some_and(|e| e.category != EntityCategory::Player)
            {
                self.frame.entities.swap_remove(victim);
                let entity = self.spawn();
                self.frame.entities.push(entity);
            }
        }
    }

    pub fn entity_count(&self) -> usize {
        self.frame.entities.len()
    }

    fn spawn(&mut self) -> EntityRecord {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        let category = EntityCategory::ALL[self.rng.gen_range(1..EntityCategory::ALL.len())];
        EntityRecord::new(id, self.random_position(), category)
    }

    fn random_position(&mut self) -> Vec3 {
        Vec3::new(
            self.rng.gen_range(-self.extent..self.extent),
            64.0,
            self.rng.gen_range(-self.extent..self.extent),
        )
    }
}

impl HostState for SyntheticWorld {
    fn capture(&self) -> Result<HostFrame, HostError> {
        Ok(self.frame.clone())
    }
}

/// Sink that counts what would have been sent to clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCounter {
    pub spawns: u64,
    pub despawns: u64,
    pub moves: u64,
}

impl TrackingSink for PacketCounter {
    fn dispatch(&mut self, _observer: ObserverId, actions: &[TrackAction]) {
        for action in actions {
            match action.kind {
                ActionKind::StartTrack => self.spawns += 1,
                ActionKind::StopTrack => self.despawns += 1,
                ActionKind::Update => self.moves += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_is_deterministic() {
        let mut a = SyntheticWorld::new(7, 100, 4, 64.0);
        let mut b = SyntheticWorld::new(7, 100, 4, 64.0);
        for _ in 0..10 {
            a.step();
            b.step();
        }

        let (a, b) = (a.capture().unwrap(), b.capture().unwrap());
        assert_eq!(a.entities, b.entities);
        assert_eq!(a.observers, b.observers);
    }

    #[test]
    fn test_observer_body_follows_observer() {
        let mut world = SyntheticWorld::new(1, 10, 2, 64.0);
        world.step();

        let frame = world.capture().unwrap();
        for observer in &frame.observers {
            let body = frame
                .entities
                .iter()
                .find(|e| Some(e.id) == observer.self_entity)
                .unwrap();
            assert_eq!(body.position, observer.position);
            assert_eq!(body.category, EntityCategory::Player);
        }
    }
}
