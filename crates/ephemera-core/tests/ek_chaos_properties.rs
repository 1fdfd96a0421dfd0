//! Property tests over random schedules of lifecycle calls and clock jumps.
//!
//! These tests verify invariants that must hold for every schedule:
//! - Accepted generations are contiguous from 1 (device, user and team)
//! - The current user key is readable right after a successful call
//! - API failures surface as transient errors and never wedge the device:
//!   a clean retry afterwards always succeeds

use std::{sync::Arc, time::Duration};

use ephemera_core::{
    DeviceId, EkConfig, EkContext, EkError, EkGeneration, EkLib, StalenessPolicy, TeamId, Uid,
    UserEkBoxStorage,
};
use ephemera_harness::{ChaoticApi, SimDevice, SimEnv, SimServer};
use proptest::prelude::*;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
enum Step {
    Keygen,
    TeamEk,
    Cleanup,
    Advance(u32),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Keygen),
        3 => Just(Step::TeamEk),
        1 => Just(Step::Cleanup),
        2 => (1u32..=96).prop_map(Step::Advance),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().expect("runtime")
}

struct World {
    server: SimServer,
    device: SimDevice,
    env: SimEnv,
    team: TeamId,
}

impl World {
    fn new(seed: u64) -> Self {
        let policy = StalenessPolicy::new(7 * DAY).with_rotation_interval(2 * DAY);
        let server = SimServer::with_seed(policy, seed);
        let uid = Uid::new("alice");
        let device = server.add_device(&uid, &DeviceId::new("laptop"));
        let team = TeamId::new("rust");
        server.add_team(&team, &[uid]);
        Self { server, device, env: SimEnv::with_seed(seed), team }
    }

    fn lib(&self, ctx: EkContext) -> EkLib<SimEnv> {
        EkLib::new(ctx, self.env.clone(), EkConfig::new(self.server.policy()))
    }

    async fn apply(&self, lib: &EkLib<SimEnv>, step: &Step) -> Result<(), EkError> {
        match step {
            Step::Keygen => lib.keygen_if_needed().await,
            Step::TeamEk => {
                let ek = lib.get_or_create_latest_team_ek(&self.team).await?;
                let latest = self.server.team_ek_generations(&self.team).last().copied();
                assert_eq!(Some(ek.metadata.generation), latest, "team ek is not the latest");
                Ok(())
            },
            Step::Cleanup => lib.cleanup_stale_user_and_device_eks().await,
            Step::Advance(hours) => {
                let by = HOUR * *hours;
                self.server.advance_time(by);
                self.env.advance(by);
                Ok(())
            },
        }
    }

    fn check_contiguous(&self) -> Result<(), TestCaseError> {
        let uid = self.device.uid();
        let histories = [
            ("device", self.server.device_ek_generations(uid, self.device.device_id())),
            ("user", self.server.user_ek_generations(uid)),
            ("team", self.server.team_ek_generations(&self.team)),
        ];
        for (scope, generations) in histories {
            let expected: Vec<EkGeneration> = (1..).take(generations.len()).collect();
            prop_assert_eq!(&generations, &expected, "{} generations have a gap", scope);
        }
        Ok(())
    }

    async fn check_current_user_ek_readable(&self) -> Result<(), TestCaseError> {
        let Some(current) = self.server.user_ek_generations(self.device.uid()).last().copied()
        else {
            return Ok(());
        };
        let read = self.device.user_storage().get(current).await;
        prop_assert!(read.is_ok(), "current user ek {} unreadable: {:?}", current, read.err());
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: without faults every call succeeds, generations stay
    /// contiguous and the current user key is readable after each call.
    #[test]
    fn prop_generations_stay_contiguous(
        seed in any::<u64>(),
        steps in prop::collection::vec(step_strategy(), 1..32),
    ) {
        runtime().block_on(async {
            let world = World::new(seed);
            let lib = world.lib(world.device.context());

            for step in &steps {
                let result = world.apply(&lib, step).await;
                prop_assert!(result.is_ok(), "{:?} failed: {:?}", step, result);
                world.check_contiguous()?;
                if matches!(step, Step::Keygen | Step::TeamEk) {
                    world.check_current_user_ek_readable().await?;
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Property: under injected API failures every error is transient, and a
    /// clean retry afterwards converges.
    #[test]
    fn prop_api_failures_never_wedge_the_device(
        seed in any::<u64>(),
        failure_rate in 0.0..0.6,
        steps in prop::collection::vec(step_strategy(), 1..32),
    ) {
        runtime().block_on(async {
            let world = World::new(seed);
            let chaotic = ChaoticApi::with_seed(world.device.clone(), failure_rate, seed);
            let lib = world.lib(world.device.context_with_api(Arc::new(chaotic)));

            for step in &steps {
                if let Err(err) = world.apply(&lib, step).await {
                    prop_assert!(err.is_transient(), "{:?} failed permanently: {}", step, err);
                }
                world.check_contiguous()?;
            }

            let clean = world.lib(world.device.context());
            let keygen = clean.keygen_if_needed().await;
            prop_assert!(keygen.is_ok(), "clean keygen failed: {:?}", keygen);
            let team = world.apply(&clean, &Step::TeamEk).await;
            prop_assert!(team.is_ok(), "clean team ek failed: {:?}", team);

            world.check_contiguous()?;
            world.check_current_user_ek_readable().await?;
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test]
async fn dropped_device_post_persists_nothing() {
    let world = World::new(41);
    let chaotic = ChaoticApi::with_seed(world.device.clone(), 1.0, 41);
    let lib = world.lib(world.device.context_with_api(Arc::new(chaotic.clone())));

    let err = lib.keygen_if_needed().await.expect_err("every call fails");
    assert!(err.is_transient());
    assert_eq!(chaotic.injected_failures(), 1);

    assert!(world.device.device_storage().generations().is_empty());
    let published =
        world.server.device_ek_generations(world.device.uid(), world.device.device_id());
    assert!(published.is_empty());
}
