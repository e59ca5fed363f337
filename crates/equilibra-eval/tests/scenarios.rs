//! End-to-end scenarios: small models driven through the full parse →
//! differentiate → closure → solve → report lifecycle.
//!
//! Input tables are seeded into the store before the model source is
//! loaded, since `file` statements resolve their tables at parse time.

use equilibra_common::{ModelErrorKind, Table};
use equilibra_eval::{Differ, Evaluator, Model, RunConfig, read_closure};

fn diff_equations(model: &mut Model) {
    let data_values = model.data_values().to_vec();
    let differ = Differ {
        catalog: &model.sets,
        data: &model.data,
        solution: &model.solution,
        data_values: &data_values,
    };
    model.equations.diff_all(&differ).unwrap();
}

/// Scalar identity: a one-equation model with the exogenous side pinned by
/// the closure. The equation ties y to x, the closure shocks x.
#[test]
fn scalar_identity_solves_to_the_shock() {
    let mut model = Model::new(RunConfig::basic(1, 1));
    model.tables_mut().insert_table(
        "data",
        "a",
        Table::with_value_rows(vec!["Value"], vec![(vec![], 2.0)]),
    );
    model
        .load_model_source(
            "file data;\n\
             datavar [fixed] a from data.a;\n\
             solvar x;\n\
             solvar y;\n\
             equation e1 : : y = x;\n",
            "test.model",
        )
        .unwrap();

    model.read_data().unwrap();
    assert_eq!(model.data_values(), &[2.0]);

    let base = read_closure(
        "add x\nshock x 0\n",
        "base0.cls",
        &model.sets,
        &model.solution,
    )
    .unwrap();
    let policy = read_closure(
        "add x\nshock x 5.0\n",
        "pol0.cls",
        &model.sets,
        &model.solution,
    )
    .unwrap();

    diff_equations(&mut model);
    model.run_passes(&[base], &[policy]).unwrap();

    let solved = &model.policy_history().solution[0][0];
    assert!((solved[0] - 5.0).abs() < 1e-12, "x carries the shock");
    assert!((solved[1] - 5.0).abs() < 1e-12, "y follows x");
}

/// Indexed sum: the equation couples a scalar to a weighted sum over a
/// set, so a unit shock across the set surfaces the weight total.
#[test]
fn indexed_sum_accumulates_the_weights() {
    let mut model = Model::new(RunConfig::basic(1, 1));
    model.tables_mut().insert_table(
        "data",
        "w",
        Table::with_value_rows(
            vec!["I", "Value"],
            vec![(vec!["i1"], 1.0), (vec!["i2"], 2.0), (vec!["i3"], 3.0)],
        ),
    );
    model
        .load_model_source(
            "file data;\n\
             set I = (i1, i2, i3);\n\
             datavar w_I from data.w;\n\
             solvar p_I;\n\
             solvar y;\n\
             equation e1 : : y = [sum : i=I : w_i * p_i];\n",
            "test.model",
        )
        .unwrap();
    model.read_data().unwrap();

    let base = read_closure("add p\n", "base0.cls", &model.sets, &model.solution).unwrap();
    let policy = read_closure(
        "add p\nshock p 1.0\n",
        "pol0.cls",
        &model.sets,
        &model.solution,
    )
    .unwrap();

    diff_equations(&mut model);
    model.run_passes(&[base], &[policy]).unwrap();

    let solved = &model.policy_history().solution[0][0];
    assert!((solved[3] - 6.0).abs() < 1e-10, "y = 1 + 2 + 3");
}

/// Substep composition: a change shock splits evenly across substeps and
/// recomposes exactly; a percent-change shock compounds through the
/// `(1+x/100)` factors and recomposes to machine tolerance.
#[test]
fn substep_composition_recovers_the_full_shock() {
    let mut model = Model::new(RunConfig::basic(1, 4));
    model
        .load_model_source("solvar [change] c;\nsolvar p;\n", "test.model")
        .unwrap();
    model.read_data().unwrap();

    let base = read_closure(
        "add c\nadd p\n",
        "base0.cls",
        &model.sets,
        &model.solution,
    )
    .unwrap();
    let policy = read_closure(
        "add c\nadd p\nshock c 10\nshock p 10\n",
        "pol0.cls",
        &model.sets,
        &model.solution,
    )
    .unwrap();
    model.run_passes(&[base], &[policy]).unwrap();

    // Compose the four substeps the way the reporter does.
    let history = model.policy_history();
    let mut change = 0.0f64;
    let mut percent = 0.0f64;
    for substep in &history.solution[0] {
        change += substep[0];
        percent = ((1.0 + percent / 100.0) * (1.0 + substep[1] / 100.0)) * 100.0 - 100.0;
    }
    assert_eq!(change, 10.0, "change shocks compose exactly");
    assert!((percent - 10.0).abs() < 1e-10);

    // Each change substep carries exactly a quarter of the shock.
    for substep in &history.solution[0] {
        assert_eq!(substep[0], 2.5);
    }
}

/// Subset mapping: a formula ranging over a subset writes only the mapped
/// slots of its superset-shaped source.
#[test]
fn subset_formula_reads_through_the_mapping() {
    let mut config = RunConfig::basic(1, 1);
    config.solve = false;
    let mut model = Model::new(config);
    model.tables_mut().insert_table(
        "data",
        "x",
        Table::with_value_rows(
            vec!["A", "Value"],
            vec![
                (vec!["a"], 10.0),
                (vec!["b"], 20.0),
                (vec!["c"], 30.0),
                (vec!["d"], 40.0),
            ],
        ),
    );
    model
        .load_model_source(
            "file data;\n\
             set A = (a, b, c, d);\n\
             set B = (b, d);\n\
             subset B of A;\n\
             datavar x_A from data.x;\n\
             datavar y_B;\n\
             formula f1 : idx=B : y_idx = x_idx;\n",
            "test.model",
        )
        .unwrap();

    model.run().unwrap();
    // y occupies the two offsets after x.
    assert_eq!(&model.data_values()[4..6], &[20.0, 40.0]);
}

/// An assertion failure is reported and counted, and the run continues.
#[test]
fn assertion_failure_does_not_abort() {
    let mut config = RunConfig::basic(1, 1);
    config.solve = false;
    let mut model = Model::new(config);
    model.tables_mut().insert_table(
        "data",
        "p",
        Table::with_value_rows(
            vec!["I", "Value"],
            vec![(vec!["i1"], 1.0), (vec!["i2"], -1.0), (vec!["i3"], 2.0)],
        ),
    );
    model
        .load_model_source(
            "file data;\n\
             set I = (i1, i2, i3);\n\
             datavar p_I from data.p;\n\
             assert nonneg : i=I : p_i >= 0;\n",
            "test.model",
        )
        .unwrap();

    model.read_data().unwrap();
    let evaluator = Evaluator::over_data(&model.sets, &model.data, model.data_values());
    assert_eq!(model.asserts.check_all(&evaluator).unwrap(), 1);

    // The same model runs to completion through the driver.
    model.run().unwrap();
}

/// Shape mismatch: two more closure entries than the system can absorb is
/// reported with the signed difference, before any solve is attempted.
#[test]
fn surplus_exogenous_variables_are_counted() {
    let mut model = Model::new(RunConfig::basic(1, 1));
    model
        .load_model_source(
            "solvar x;\n\
             solvar y;\n\
             equation e1 : : x = 0;\n\
             equation e2 : : y = 0;\n",
            "test.model",
        )
        .unwrap();
    model.read_data().unwrap();

    let closure = read_closure(
        "add x\nadd y\n",
        "base0.cls",
        &model.sets,
        &model.solution,
    )
    .unwrap();
    diff_equations(&mut model);

    let err = model
        .run_passes(std::slice::from_ref(&closure), std::slice::from_ref(&closure))
        .unwrap_err();
    assert_eq!(err.kind, ModelErrorKind::Shape);
    assert!(err.to_string().contains("2 too many exogenous variables"));
}

/// The mirror image: too few exogenous variables.
#[test]
fn missing_exogenous_variables_are_counted() {
    let mut model = Model::new(RunConfig::basic(1, 1));
    model
        .load_model_source(
            "set I = (i1, i2, i3);\n\
             solvar x_I;\n\
             solvar y;\n\
             equation e1 : : y = [sum : i=I : x_i];\n\
             equation e2 : : y = 0;\n",
            "test.model",
        )
        .unwrap();
    model.read_data().unwrap();

    let closure = read_closure("", "base0.cls", &model.sets, &model.solution).unwrap();
    diff_equations(&mut model);

    let err = model
        .run_passes(std::slice::from_ref(&closure), std::slice::from_ref(&closure))
        .unwrap_err();
    assert_eq!(err.kind, ModelErrorKind::Shape);
    assert!(err.to_string().contains("2 too few exogenous variables"));
}
