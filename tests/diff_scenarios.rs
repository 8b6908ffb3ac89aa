use binmatch::database::{
    BasicBlockDescription, CallDescription, CallGraphDescription, FlowEdgeDescription,
    FlowGraphDescription, FunctionDescription, InstructionDescription, MetaInformation,
    ProgramExport,
};
use binmatch::similarity::confidence_map;
use binmatch::steps::{default_basic_block_steps, default_call_graph_steps};
use binmatch::{Address, DiffResults, DiffSession};

fn function(address: Address) -> FunctionDescription {
    FunctionDescription {
        address,
        name: None,
        demangled_name: None,
        library: false,
        stub: false,
        imported: false,
    }
}

fn named_function(address: Address, name: &str) -> FunctionDescription {
    FunctionDescription {
        name: Some(name.to_string()),
        ..function(address)
    }
}

fn instruction(address: Address, mnemonic: &str) -> InstructionDescription {
    InstructionDescription {
        address,
        mnemonic: mnemonic.to_string(),
        operands: String::new(),
        call_target: None,
    }
}

fn call_instruction(address: Address, target: Address) -> InstructionDescription {
    InstructionDescription {
        call_target: Some(target),
        ..instruction(address, "call")
    }
}

fn block(address: Address, instructions: Vec<InstructionDescription>) -> BasicBlockDescription {
    BasicBlockDescription {
        address,
        instructions,
    }
}

fn edge(source: Address, target: Address) -> FlowEdgeDescription {
    FlowEdgeDescription {
        source,
        target,
        kind: Default::default(),
    }
}

fn flow_graph(
    address: Address,
    basic_blocks: Vec<BasicBlockDescription>,
    edges: Vec<FlowEdgeDescription>,
) -> FlowGraphDescription {
    FlowGraphDescription {
        address,
        basic_blocks,
        edges,
    }
}

fn export(
    name: &str,
    vertices: Vec<FunctionDescription>,
    calls: Vec<(Address, Address)>,
    flow_graphs: Vec<FlowGraphDescription>,
) -> ProgramExport {
    ProgramExport {
        meta: MetaInformation {
            input_binary: name.to_string(),
            input_hash: format!("hash-of-{name}"),
        },
        call_graph: CallGraphDescription {
            vertices,
            edges: calls
                .into_iter()
                .map(|(source, target)| CallDescription { source, target })
                .collect(),
        },
        flow_graphs,
    }
}

fn find_match(results: &DiffResults, primary_address: Address) -> &binmatch::FunctionMatch {
    results
        .matches
        .iter()
        .find(|m| m.primary_address == primary_address)
        .unwrap_or_else(|| panic!("no match for {primary_address:#x}"))
}

fn assert_scores_in_unit_interval(results: &DiffResults) {
    assert!((0.0..=1.0).contains(&results.similarity));
    assert!((0.0..=1.0).contains(&results.confidence));
    for m in &results.matches {
        assert!((0.0..=1.0).contains(&m.similarity));
        assert!((0.0..=1.0).contains(&m.confidence));
    }
}

#[test]
fn identical_single_function_programs_are_a_perfect_diff() {
    let side = || {
        export(
            "single",
            vec![function(0x1000)],
            vec![],
            vec![flow_graph(
                0x1000,
                vec![block(0x1000, vec![instruction(0x1000, "ret")])],
                vec![],
            )],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    assert_eq!(results.matches.len(), 1);
    let m = find_match(&results, 0x1000);
    assert_eq!(m.basic_block_matches, 1);
    assert_eq!(m.instruction_matches, 1);
    assert_eq!(m.change, "identical");
    assert_eq!(results.similarity, 1.0);
    assert!(results.confidence > 0.9);
    assert!(results.unmatched_primary.is_empty());
    assert!(results.unmatched_secondary.is_empty());
    assert_scores_in_unit_interval(&results);
}

#[test]
fn identical_call_chain_matches_entirely_through_the_hash_step() {
    let side = || {
        export(
            "chain",
            vec![function(0x1000), function(0x2000), function(0x3000)],
            vec![(0x1000, 0x2000), (0x2000, 0x3000)],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(
                        0x1000,
                        vec![
                            call_instruction(0x1000, 0x2000),
                            instruction(0x1005, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x2000,
                    vec![block(
                        0x2000,
                        vec![
                            call_instruction(0x2000, 0x3000),
                            instruction(0x2005, "nop"),
                            instruction(0x2006, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x3000,
                    vec![block(
                        0x3000,
                        vec![instruction(0x3000, "xor"), instruction(0x3002, "ret")],
                    )],
                    vec![],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    assert_eq!(results.matches.len(), 3);
    assert_eq!(results.histogram["function: hash matching"], 3);
    for m in &results.matches {
        assert_eq!(m.step, "function: hash matching");
        assert_eq!(m.primary_address, m.secondary_address);
        assert_eq!(m.change, "identical");
    }
    assert_eq!(results.similarity, 1.0);

    // The histogram sums to the function plus basic block fixed points.
    let histogram_total: u64 = results.histogram.values().sum();
    let block_matches: usize = results.matches.iter().map(|m| m.basic_block_matches).sum();
    assert_eq!(histogram_total as usize, results.matches.len() + block_matches);

    // No more fixed points than functions on the smaller side.
    assert!(results.matches.len() as u64 <= results.counts["functions primary (non-library)"]);
    assert_scores_in_unit_interval(&results);
}

#[test]
fn every_histogram_entry_is_a_registered_step() {
    let side = || {
        export(
            "registered",
            vec![named_function(0x1000, "main"), function(0x2000)],
            vec![(0x1000, 0x2000)],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(
                        0x1000,
                        vec![
                            call_instruction(0x1000, 0x2000),
                            instruction(0x1005, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x2000,
                    vec![block(0x2000, vec![instruction(0x2000, "ret")])],
                    vec![],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    let confidences = confidence_map(&default_call_graph_steps(), &default_basic_block_steps());
    for name in results.histogram.keys() {
        let prior = confidences
            .get(name.as_str())
            .unwrap_or_else(|| panic!("histogram step {name:?} is not registered"));
        assert!(prior.is_finite() && (0.0..=1.0).contains(prior));
    }
}

#[test]
fn a_single_changed_instruction_is_classified_as_instructions_changed() {
    let side = |second_block_mnemonic: &str| {
        export(
            "delta",
            vec![function(0x1000), function(0x2000)],
            vec![(0x1000, 0x2000)],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(
                        0x1000,
                        vec![
                            call_instruction(0x1000, 0x2000),
                            instruction(0x1005, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x2000,
                    vec![
                        block(
                            0x2000,
                            vec![instruction(0x2000, "push"), instruction(0x2001, "mov")],
                        ),
                        block(
                            0x2010,
                            vec![
                                instruction(0x2010, second_block_mnemonic),
                                instruction(0x2012, "ret"),
                            ],
                        ),
                    ],
                    vec![edge(0x2000, 0x2010)],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side("add"), &side("xor"));
    let results = session.diff();

    assert_eq!(results.matches.len(), 2);
    assert_eq!(find_match(&results, 0x1000).change, "identical");

    let changed = find_match(&results, 0x2000);
    assert_eq!(changed.secondary_address, 0x2000);
    assert_eq!(changed.basic_block_matches, 2, "block B must still match");
    assert_eq!(changed.instruction_matches, 3, "one instruction pair is lost");
    assert_eq!(changed.change, "instructions changed");
    assert!(results.similarity < 1.0);
    assert_scores_in_unit_interval(&results);
}

#[test]
fn ambiguous_hashes_are_resolved_by_the_md_index_step() {
    // Both functions carry the same instruction stream, so their content
    // hashes collide; only the control flow shape tells them apart.
    let side = || {
        export(
            "ambiguous",
            vec![function(0x1000), function(0x2000)],
            vec![],
            vec![
                flow_graph(
                    0x1000,
                    vec![
                        block(0x1000, vec![instruction(0x1000, "nop")]),
                        block(0x1010, vec![instruction(0x1010, "ret")]),
                    ],
                    vec![edge(0x1000, 0x1010)],
                ),
                flow_graph(
                    0x2000,
                    vec![block(
                        0x2000,
                        vec![instruction(0x2000, "nop"), instruction(0x2002, "ret")],
                    )],
                    vec![],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    assert_eq!(results.matches.len(), 2);
    for address in [0x1000, 0x2000] {
        assert_eq!(
            find_match(&results, address).step,
            "function: MD index matching (flow graph)"
        );
    }
    assert!(!results.histogram.contains_key("function: hash matching"));
    assert_eq!(
        results.histogram["function: MD index matching (flow graph)"],
        2
    );
}

#[test]
fn call_reference_refinement_matches_positionally_corresponding_callees() {
    // The parents are byte-identical; the leaves differ in content, so no
    // fingerprint step can pair them before refinement walks the matched call
    // instructions.
    let side = |leaf_mnemonic: &str| {
        export(
            "refine",
            vec![function(0x1000), function(0x3000)],
            vec![(0x1000, 0x3000)],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(
                        0x1000,
                        vec![
                            call_instruction(0x1000, 0x3000),
                            instruction(0x1005, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x3000,
                    vec![block(
                        0x3000,
                        vec![
                            instruction(0x3000, leaf_mnemonic),
                            instruction(0x3002, "ret"),
                        ],
                    )],
                    vec![],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side("mov"), &side("sub"));
    let results = session.diff();

    assert_eq!(results.matches.len(), 2);
    assert_eq!(find_match(&results, 0x1000).step, "function: hash matching");
    let refined = find_match(&results, 0x3000);
    assert_eq!(refined.step, "function: call reference matching");
    assert_eq!(refined.secondary_address, 0x3000);
    assert_eq!(results.histogram["function: call reference matching"], 1);
}

#[test]
fn imported_functions_match_as_stubs_by_name() {
    let side = || {
        export(
            "imports",
            vec![function(0x1000), named_function(0x5000, "printf")],
            vec![(0x1000, 0x5000)],
            vec![flow_graph(
                0x1000,
                vec![block(
                    0x1000,
                    vec![
                        call_instruction(0x1000, 0x5000),
                        instruction(0x1005, "ret"),
                    ],
                )],
                vec![],
            )],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    assert_eq!(results.matches.len(), 2);
    let import = find_match(&results, 0x5000);
    assert_eq!(import.step, "function: name hash matching");
    assert_eq!(import.basic_block_matches, 0);
    assert_eq!(import.instruction_matches, 0);
    // Synthesized stubs count as library functions.
    assert_eq!(results.counts["functions primary (library)"], 1);
    assert_eq!(results.counts["function matches (library)"], 1);
}

#[test]
fn all_library_programs_have_zero_global_similarity() {
    let side = || {
        let mut lib = function(0x1000);
        lib.library = true;
        export(
            "libonly",
            vec![lib],
            vec![],
            vec![flow_graph(
                0x1000,
                vec![block(
                    0x1000,
                    vec![instruction(0x1000, "push"), instruction(0x1001, "ret")],
                )],
                vec![],
            )],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    assert_eq!(results.matches.len(), 1);
    assert_eq!(results.similarity, 0.0);
    // The per-function similarity is unaffected by the library exclusion.
    assert_eq!(find_match(&results, 0x1000).similarity, 1.0);
}

#[test]
fn empty_programs_produce_an_empty_diff() {
    let side = || export("empty", vec![], vec![], vec![]);
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    assert!(results.matches.is_empty());
    assert!(results.histogram.is_empty());
    assert_eq!(results.similarity, 0.0);
    assert_eq!(results.confidence, 0.0);
}

#[test]
fn reset_and_rerun_reproduces_the_same_results() {
    let side = |second_block_mnemonic: &str| {
        export(
            "rerun",
            vec![function(0x1000), function(0x2000), function(0x3000)],
            vec![(0x1000, 0x2000), (0x1000, 0x3000)],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(
                        0x1000,
                        vec![
                            call_instruction(0x1000, 0x2000),
                            call_instruction(0x1005, 0x3000),
                            instruction(0x100a, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x2000,
                    vec![
                        block(0x2000, vec![instruction(0x2000, "push")]),
                        block(
                            0x2010,
                            vec![
                                instruction(0x2010, second_block_mnemonic),
                                instruction(0x2012, "ret"),
                            ],
                        ),
                    ],
                    vec![edge(0x2000, 0x2010)],
                ),
                flow_graph(
                    0x3000,
                    vec![block(0x3000, vec![instruction(0x3000, "ret")])],
                    vec![],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side("add"), &side("xor"));
    session.diff();
    let first = session.results();
    session.reset_matches();
    session.diff();
    let second = session.results();

    assert_eq!(
        serde_json::to_value(&first).expect("serialize"),
        serde_json::to_value(&second).expect("serialize")
    );
}

#[test]
fn matched_flags_mirror_the_fixed_point_set() {
    let side = || {
        export(
            "flags",
            vec![function(0x1000), function(0x9000)],
            vec![],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(0x1000, vec![instruction(0x1000, "ret")])],
                    vec![],
                ),
                flow_graph(
                    0x9000,
                    vec![block(
                        0x9000,
                        vec![instruction(0x9000, "nop"), instruction(0x9002, "ret")],
                    )],
                    vec![],
                ),
            ],
        )
    };
    // Remove the second function from the secondary side so it stays
    // unmatched.
    let primary = side();
    let mut secondary = side();
    secondary.call_graph.vertices.truncate(1);
    secondary.flow_graphs.truncate(1);

    let mut session = DiffSession::from_exports(&primary, &secondary);
    let results = session.diff();

    assert_eq!(results.matches.len(), 1);
    assert_eq!(results.unmatched_primary.len(), 1);
    assert_eq!(results.unmatched_primary[0].address, 0x9000);
    assert!(results.unmatched_secondary.is_empty());

    let context = session.context();
    for (_, fixed_point) in context.fixed_points.iter() {
        assert!(context.primary.flow_graphs[fixed_point.primary].is_matched());
        assert!(context.secondary.flow_graphs[fixed_point.secondary].is_matched());
    }
}

#[test]
fn the_instruction_cache_is_cleared_when_the_session_drops() {
    let side = || {
        export(
            "cleanup",
            vec![function(0x1000)],
            vec![],
            vec![flow_graph(
                0x1000,
                vec![block(0x1000, vec![instruction(0x1000, "ret")])],
                vec![],
            )],
        )
    };
    let session = DiffSession::from_exports(&side(), &side());
    let cache = session.instruction_cache().clone();
    assert!(!cache.is_empty());
    drop(session);
    assert!(cache.is_empty());
}

#[test]
fn results_round_trip_through_json_and_csv() {
    let side = || {
        export(
            "persist",
            vec![named_function(0x1000, "main"), function(0x2000)],
            vec![(0x1000, 0x2000)],
            vec![
                flow_graph(
                    0x1000,
                    vec![block(
                        0x1000,
                        vec![
                            call_instruction(0x1000, 0x2000),
                            instruction(0x1005, "ret"),
                        ],
                    )],
                    vec![],
                ),
                flow_graph(
                    0x2000,
                    vec![block(0x2000, vec![instruction(0x2000, "ret")])],
                    vec![],
                ),
            ],
        )
    };
    let mut session = DiffSession::from_exports(&side(), &side());
    let results = session.diff();

    let dir = tempfile::tempdir().expect("tempdir");
    let json_path = dir.path().join("results.json");
    binmatch::database::save_results(&results, &json_path).expect("save");
    let loaded = binmatch::database::load_results(&json_path).expect("load");
    assert_eq!(loaded.metadata.total_matches, results.matches.len());
    assert_eq!(loaded.results.matches.len(), results.matches.len());
    assert_eq!(loaded.results.similarity, results.similarity);

    let csv_path = dir.path().join("results.csv");
    binmatch::database::export_to_csv(&results, &csv_path).expect("csv");
    let csv = std::fs::read_to_string(&csv_path).expect("read csv");
    assert_eq!(csv.lines().count(), results.matches.len() + 1);

    let statistics = binmatch::database::generate_statistics(&results);
    assert_eq!(statistics.total_matches, results.matches.len());
    assert_eq!(statistics.identical, results.matches.len());

    let report = binmatch::report::generate_text_report(&results);
    assert!(report.contains("BINARY DIFF REPORT"));
    assert!(report.contains("main"));
}

#[test]
fn sessions_can_be_built_from_export_files() {
    let side = export(
        "onfile",
        vec![function(0x1000)],
        vec![],
        vec![flow_graph(
            0x1000,
            vec![block(0x1000, vec![instruction(0x1000, "ret")])],
            vec![],
        )],
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("export.json");
    std::fs::write(&path, serde_json::to_string(&side).expect("serialize")).expect("write");

    let mut session = DiffSession::from_files(&path, &path).expect("session");
    let results = session.diff();
    assert_eq!(results.matches.len(), 1);
    assert_eq!(results.similarity, 1.0);
}

#[test]
fn a_malformed_export_file_is_reported_to_the_caller() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("truncated.json");
    std::fs::write(&path, "{ \"meta\": {").expect("write");
    assert!(DiffSession::from_files(&path, &path).is_err());
}
