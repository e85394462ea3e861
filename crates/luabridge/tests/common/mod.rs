#![allow(dead_code)]

use luabridge::{Bridge, BridgeConfig, Handle};
use luabridge_sim::{SimGuest, SimProbe};

pub fn quiet() -> BridgeConfig {
    BridgeConfig::default().quiet()
}

pub fn bridge_with(config: BridgeConfig) -> (Bridge, SimProbe) {
    let sim = SimGuest::new();
    let probe = sim.probe();
    (Bridge::with_surface(Box::new(sim), config), probe)
}

pub fn bridge() -> (Bridge, SimProbe) {
    bridge_with(quiet())
}

/// A bridge with one live instance.
pub fn instance() -> (Bridge, SimProbe, Handle) {
    let (mut bridge, probe) = bridge();
    let h = bridge.create_instance().expect("create instance");
    (bridge, probe, h)
}

pub fn run(bridge: &mut Bridge, h: Handle, src: &str) -> Vec<luabridge::HostValue> {
    bridge.load(h, src, false).expect("load");
    bridge.execute(h).expect("execute")
}
