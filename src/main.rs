//! salu-emu: software model of a switch stateful ALU

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use salu_emu::config::Config;
use salu_emu::pipeline::Pipeline;
use salu_emu::program::Program;
use salu_emu::testing::ScenarioRunner;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario against its program
    Run {
        /// Scenario file (defaults to the configured scenario)
        scenario: Option<PathBuf>,
        /// Program file, overriding the scenario's own
        #[clap(short, long)]
        program: Option<PathBuf>,
        /// Worker threads for packet bursts
        #[clap(short, long)]
        workers: Option<usize>,
        /// Print non-zero register cells when done
        #[clap(long)]
        dump_registers: bool,
    },
    /// Load a program and print what it declares
    Inspect {
        /// Program file (defaults to the configured program)
        program: Option<PathBuf>,
    },
    /// Show configuration sources and a sample config file
    Config,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match args.command {
        Command::Run {
            scenario,
            program,
            workers,
            dump_registers,
        } => run(scenario, program, workers, dump_registers),
        Command::Inspect { program } => inspect(program),
        Command::Config => {
            show_config();
            Ok(())
        }
    }
}

fn run(
    scenario: Option<PathBuf>,
    program: Option<PathBuf>,
    workers: Option<usize>,
    dump_registers: bool,
) -> anyhow::Result<()> {
    let config = Config::get();
    let scenario = scenario
        .or_else(|| config.scenario_path())
        .context("no scenario given and none configured")?;

    let runner = ScenarioRunner::new().with_workers(workers.unwrap_or_else(|| config.workers()));
    let (pipeline, result) = runner
        .run_file(&scenario, program.as_deref())
        .with_context(|| format!("failed to start scenario {}", scenario.display()))?;

    println!("Scenario: {}", result.name);
    println!("Program:  {}", pipeline.name());
    println!();
    for step in &result.steps {
        println!("  [{:>3}] {:<22} ok    {}", step.index, step.action, step.detail);
    }
    if let Some((index, message)) = &result.failure {
        println!("  [{:>3}] {:<22} FAIL  {}", index, "", message);
    }
    println!();
    println!("{}/{} steps passed", result.steps.len(), result.total_steps);

    if dump_registers {
        println!();
        println!("Registers");
        println!("=========");
        for reg in pipeline.objects().registers() {
            println!("{:?}", reg);
        }
    }

    if !result.passed {
        bail!("scenario '{}' failed", result.name);
    }
    Ok(())
}

fn inspect(program: Option<PathBuf>) -> anyhow::Result<()> {
    let path = program
        .or_else(|| Config::get().program_path())
        .context("no program given and none configured")?;
    let program = Program::from_file(&path)?;
    let pipeline = Pipeline::load(&program)
        .with_context(|| format!("invalid program {}", path.display()))?;
    let objects = pipeline.objects();

    println!("Program: {}", pipeline.name());
    println!();

    println!("Registers");
    println!("=========");
    for reg in objects.registers() {
        println!("  {:<24} {} x {}b", reg.name(), reg.size(), reg.bitwidth());
    }

    println!();
    println!("PHV fields");
    println!("==========");
    for field in objects.layout().fields() {
        println!("  {:<24} {}b", field.name, field.bitwidth);
    }

    println!();
    println!("Hash calculations");
    println!("=================");
    for decl in &program.hashes {
        println!("  {:<24} {} over {}", decl.name, decl.algorithm, decl.fields.join(", "));
    }

    println!();
    println!("Selector tables");
    println!("===============");
    for table in objects.selector_tables() {
        println!(
            "  {:<24} profile {} selector {:?}",
            table.name(),
            table.action_profile().name(),
            table.action_profile().group_selector()
        );
    }

    println!();
    println!("Stateful ALUs");
    println!("=============");
    for alu in pipeline.externs().stateful_alus() {
        let config = alu.config();
        println!("  [{}] {:<20} {} on {}", alu.id(), alu.name(), config, alu.register().name());
        for (attribute, expr) in config.expressions() {
            if !expr.empty() {
                println!("        {:<24} {}", attribute, expr);
            }
        }
        if let Some(table) = alu.selector_binding() {
            println!("        selector_binding         {}", table.name());
        }
        let math = &config.math_unit;
        if math.is_configured() {
            println!(
                "        math_unit                scale {} shift {} invert {} table {:?}",
                math.output_scale, math.exponent_shift, math.exponent_invert, math.lookup_table
            );
        }
        println!("        logging_mode             {:?}", config.logging_mode);
    }

    println!();
    println!("Control sequence: {} steps", pipeline.control_len());
    for call in &program.control {
        println!("  {}.{}", call.alu, call.method.name());
    }

    Ok(())
}

fn show_config() {
    let config = Config::get();
    match Config::user_config_path() {
        Some(path) => println!("User config: {}", path.display()),
        None => println!("User config: (no config directory)"),
    }
    println!("Effective:   {:?}", config);
    println!("Workers:     {}", config.workers());
    println!();
    print!("{}", Config::sample_config());
}
