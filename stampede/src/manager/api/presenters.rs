//! Mappers from core types to the REST response bodies. Output lists are
//! sorted so clients see stable orderings.

use crate::core;

use super::model;

/// Present a scenario.
#[must_use]
pub fn present_scenario(scenario: &core::ScenarioDetails) -> model::ScenarioInfo {
    model::ScenarioInfo {
        name: scenario.name.clone(),
        description: scenario.description.clone(),
    }
}

/// Present an increment, scenario counters sorted by name.
#[must_use]
pub fn present_increment(increment: &core::IncrementDetails) -> model::IncrementInfo {
    let mut scenarios: Vec<model::ScenarioCounter> = increment
        .scenarios
        .iter()
        .map(|(scenario, counter)| model::ScenarioCounter {
            scenario: scenario.clone(),
            counter: *counter,
        })
        .collect();
    scenarios.sort_by(|a, b| a.scenario.cmp(&b.scenario));

    model::IncrementInfo {
        id: increment.id,
        scenarios,
    }
}

/// Present an attack, increments sorted by id.
#[must_use]
pub fn present_attack(attack: &core::AttackDetails) -> model::AttackInfo {
    let mut increments: Vec<model::IncrementInfo> =
        attack.increments.iter().map(present_increment).collect();
    increments.sort_by_key(|increment| increment.id);

    let const_config = attack
        .const_config
        .as_ref()
        .map(|config| model::ConstConfigBody {
            scenarios: config.scenarios.clone(),
        });
    let linear_config = attack
        .linear_config
        .as_ref()
        .map(|config| model::LinearConfigBody {
            warm_up_sec: config.warm_up_sec,
            start_counter: config.start_counter,
            end_counter: config.end_counter,
            counter_step: config.counter_step,
            step_interval_sec: config.step_interval_sec,
            scenarios: config.scenarios.clone(),
        });

    model::AttackInfo {
        id: attack.id,
        name: attack.name.clone(),
        wait_time_sec: attack.wait_time_sec,
        created_at: attack.created_at_unix,
        duration_sec: attack.duration_sec,
        const_config,
        linear_config,
        increments,
    }
}

/// Present a node, attacks sorted by id and scenario names sorted.
#[must_use]
pub fn present_node(node: &core::NodeDetails) -> model::NodeInfo {
    let mut attacks: Vec<model::AttackInfo> = node.attacks.iter().map(present_attack).collect();
    attacks.sort_by_key(|attack| attack.id);

    let mut scenarios: Vec<String> = node
        .scenarios
        .iter()
        .map(|scenario| scenario.name.clone())
        .collect();
    scenarios.sort();

    model::NodeInfo {
        name: node.name.clone(),
        scenarios,
        attacks,
        is_active: node.is_active,
    }
}

/// Present a list of attacks, sorted by id.
#[must_use]
pub fn present_attack_list(attacks: &[core::AttackDetails]) -> Vec<model::AttackInfo> {
    let mut list: Vec<model::AttackInfo> = attacks.iter().map(present_attack).collect();
    list.sort_by_key(|attack| attack.id);
    list
}

/// Present a list of nodes, sorted by name.
#[must_use]
pub fn present_node_list(nodes: &[core::NodeDetails]) -> Vec<model::NodeInfo> {
    let mut list: Vec<model::NodeInfo> = nodes.iter().map(present_node).collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}

/// Present a list of scenarios, sorted by name.
#[must_use]
pub fn present_scenario_list(scenarios: &[core::ScenarioDetails]) -> Vec<model::ScenarioInfo> {
    let mut list: Vec<model::ScenarioInfo> = scenarios.iter().map(present_scenario).collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}
