mod cli;

use refeval::results::CacheHandle;
use refeval::{EvalContext, Ref, ResourceId, ResourceTree, SerializeOptions, Value, Vars};

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("REFEVAL_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Evaluate(eval_cli) => evaluate(eval_cli),
        cli::Command::Diff(diff_cli) => diff(diff_cli),
        cli::Command::Dev(dev_cli) => dev(dev_cli),
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

pub fn evaluate(cli: cli::EvaluateCommand) -> anyhow::Result<()> {
    let tree = load(&cli.input)?;
    let current = select_resource(&tree, cli.resource.as_deref())?;

    let mut vars = Vars::new();
    for (name, value) in &cli.vars {
        vars.insert(name.clone(), serde_yaml::from_str(value)?);
    }

    let reference = parse_reference(&cli.expression)?.with_vars(vars);
    let ctx = EvalContext::new(current.into()).with_trace(cli.trace);
    let mut matches = reference.resolve_in(&tree, &ctx)?;

    let value = match matches.len() {
        _ if cli.all => Value::Array(matches),
        0 => Value::Null,
        1 => matches.remove(0),
        _ => Value::Array(matches),
    };

    let value = if cli.serialize {
        tree.serialize(&value, &SerializeOptions::default())?
    } else {
        // resources are printed as references
        tree.serialize(&tree.materialize(&value)?, &SerializeOptions::default())?
    };

    output(&cli.output, &value)
}

/// A YAML reference document when the expression is one, a path expression otherwise
fn parse_reference(expression: &str) -> anyhow::Result<Ref> {
    match serde_yaml::from_str::<Value>(expression) {
        Ok(document) if Ref::is_ref(&document) => Ok(Ref::from_value(&document)?),
        _ => Ok(Ref::new(expression, Vars::new())?),
    }
}

pub fn diff(cli: cli::DiffCommand) -> anyhow::Result<()> {
    let mut tree = load(&cli.input)?;
    let resource = select_resource(&tree, cli.resource.as_deref())?;
    tree.attributes(resource).resolve_all()?;

    for (path, value) in &cli.set {
        let value: Value = serde_yaml::from_str(value)?;
        let (handle, key) = locate(&tree, resource, path)?;
        let is_list = tree.results(handle).is_list();

        let mut results = tree.results_mut(handle);
        if is_list {
            results.set_index(key.parse()?, value)?;
        } else {
            results.set(&key, value)?;
        }
    }

    for path in &cli.delete {
        let (handle, key) = locate(&tree, resource, path)?;
        let is_list = tree.results(handle).is_list();

        let mut results = tree.results_mut(handle);
        if is_list {
            results.remove(key.parse()?)?;
        } else {
            anyhow::ensure!(results.delete(&key)?, "no attribute `{path}` to delete");
        }
    }

    let diff = tree.attributes(resource).get_diff()?;
    output(&cli.output, &tree.serialize(&diff, &SerializeOptions::default())?)
}

/// Container holding the last segment of `a::b::c` and that segment
fn locate(tree: &ResourceTree, resource: ResourceId, path: &str) -> anyhow::Result<(CacheHandle, String)> {
    let mut segments: Vec<&str> = path.split("::").collect();
    let last = segments.pop().unwrap_or_default().to_string();

    let mut handle = tree.attributes(resource).handle();
    for segment in segments {
        let results = tree.results(handle);
        let value = if results.is_list() {
            results.get_index(segment.parse()?)?
        } else {
            results.get(segment)?
        };

        handle = match value {
            Some(Value::Lazy(handle)) => handle,
            Some(other) => anyhow::bail!("`{segment}` in `{path}` is a {}", other.type_name()),
            None => anyhow::bail!("`{segment}` in `{path}` does not exist"),
        };
    }

    Ok((handle, last))
}

fn select_resource(tree: &ResourceTree, name: Option<&str>) -> anyhow::Result<ResourceId> {
    match name {
        Some(name) => tree
            .find(name)
            .ok_or_else(|| anyhow::anyhow!("No resource named `{name}`")),
        None => tree
            .ids()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No resources loaded")),
    }
}

fn load(input: &cli::InputArgs) -> anyhow::Result<ResourceTree> {
    let mut tree = ResourceTree::new();

    if !input.workdir && input.files.is_empty() && input.directories.is_empty() {
        let stdin = std::io::read_to_string(std::io::stdin())?;
        tree.load_str(&stdin)?;
        return Ok(tree);
    }

    if input.workdir {
        tree.load_directory(&std::env::current_dir()?)?;
    }

    for file_path in &input.files {
        tree.load_file(file_path)?;
    }

    for dir_path in &input.directories {
        tree.load_directory(dir_path)?;
    }

    anyhow::ensure!(!tree.is_empty(), "No files loaded");

    Ok(tree)
}

fn output(output: &cli::OutputArgs, value: &Value) -> anyhow::Result<()> {
    match output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), value)?,
        cli::OutputFormat::Json => {
            serde_json::to_writer_pretty(std::io::stdout(), value)?;
            println!();
        }
    };

    Ok(())
}

/// (refeval-)developer utilities
///
/// A quick way to expose internal structures for debugging purposes
pub fn dev(cli: cli::DevCommand) -> anyhow::Result<()> {
    use cli::DevSubCommand::*;

    match cli.command {
        Parse { expression } => {
            let path = refeval::Path::parse(&expression)?;
            println!("{path}");
            println!("{path:#?}");
        }
        Tree { input } => {
            let tree = load(&input)?;
            for id in tree.ids().filter(|id| tree.parent(*id).is_none()) {
                for resource in tree.descendants(id) {
                    let depth = tree.ancestors(resource).len() - 1;
                    let keys = tree.attributes(resource).keys().join(", ");
                    println!("{:indent$}{} [{keys}]", "", tree.name(resource), indent = depth * 2);
                }
            }
        }
    }

    Ok(())
}
