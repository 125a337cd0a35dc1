//! A configuration exported to INI and imported into another object ends up identical.

use ovs_arakoon::{ClusterConfig, ConfigFormat, ConfigRepr, NodeConfig};

fn single_node(cluster_id: &str) -> ClusterConfig {
    let mut config = ClusterConfig::new(cluster_id);
    let mut node = NodeConfig::new("f4b3bc4a", "10.100.199.171");
    node.client_port = 26400;
    node.messaging_port = 26401;
    node.home = format!("/opt/OpenvStorage/db/arakoon/{cluster_id}/db");
    node.tlog_dir = format!("/opt/OpenvStorage/db/arakoon/{cluster_id}/tlogs");
    node.log_sinks = format!("console:{cluster_id}");
    node.crash_log_sinks = format!("console:{cluster_id}_crash");
    config.nodes.push(node);
    config
        .extra_globals
        .insert("__tainted_tlog_entries_per_file".to_string(), "5000".to_string());
    config
}

#[test]
fn test_export_import_round_trip() {
    let original = single_node("ovsdb");
    let exported = original.export_ini();

    let parsed = ClusterConfig::from_ini("ovsdb", &exported).unwrap();
    assert_eq!(parsed, original);

    // A fresh object that only knows the node name picks up everything else.
    let mut fresh = ClusterConfig::new("ovsdb");
    fresh.nodes.push(NodeConfig::new("f4b3bc4a", "0.0.0.0"));
    fresh.import_config(ConfigRepr::Ini(exported.clone())).unwrap();

    assert_eq!(fresh.nodes, original.nodes);
    assert_eq!(fresh.extra_globals, original.extra_globals);
    assert_eq!(fresh.export_ini(), exported);
}

#[test]
fn test_dict_and_ini_convert_both_ways() {
    let original = single_node("abm");
    let ConfigRepr::Dict(dict) = ClusterConfig::convert_config_to(
        ConfigRepr::Ini(original.export_ini()),
        ConfigFormat::Dict,
    )
    .unwrap() else {
        panic!("expected a dictionary");
    };
    assert_eq!(dict, original.export_dict());

    let ConfigRepr::Ini(ini) =
        ClusterConfig::convert_config_to(ConfigRepr::Dict(dict), ConfigFormat::Ini).unwrap()
    else {
        panic!("expected INI text");
    };
    assert_eq!(ini, original.export_ini());
}
