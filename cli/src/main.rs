use camino::Utf8PathBuf;
use clap::Parser;

use dehumidifier::{BuildContext, DEFAULT_TARGET, Services, Settings, pipeline};

/// Republishes a game's managed assemblies as reference NuGet packages.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Folder name of the game under `Games/`.
    #[arg(long)]
    game: String,

    /// Steam build id to package.
    #[arg(long = "build")]
    build_id: Option<u32>,

    #[arg(long, env = "STEAM_USERNAME", default_value = "")]
    steam_username: String,

    #[arg(long, env = "NUGET_API_KEY", hide_env_values = true)]
    nuget_api_key: Option<String>,

    /// Root of the metadata repository.
    #[arg(long, default_value = ".")]
    root: Utf8PathBuf,

    /// Task to run, along with everything it depends on.
    #[arg(long, default_value = DEFAULT_TARGET)]
    target: String,

    #[arg(long, env = "GITHUB_OUTPUT")]
    github_output: Option<Utf8PathBuf>,

    /// Print the task graph as a Mermaid diagram and exit.
    #[arg(long)]
    graph: bool,
}

impl Args {
    fn settings(self) -> Settings {
        let mut settings = Settings::new(self.game, self.root);
        settings.build_id = self.build_id;
        if !self.steam_username.trim().is_empty() {
            settings.steam_username = self.steam_username;
        }
        settings.nuget_api_key = self.nuget_api_key.filter(|key| !key.is_empty());
        settings.github_output = self.github_output;
        settings
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dehumidifier::init_logging()?;

    if args.graph {
        print!("{}", pipeline::build_graph()?);
        return Ok(());
    }

    let target = args.target.clone();
    let settings = args.settings();
    let services = Services::standard(&settings)?;
    let context = BuildContext::new(settings, services);

    tracing::info!("Running '{target}' for {}", context.settings.game);
    let report = pipeline::run(&context, &target)?;
    tracing::info!("{}", report.summary());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_username_stays_anonymous() {
        let args = Args::parse_from(["dehumidifier", "--game", "Game", "--steam-username", " "]);
        let settings = args.settings();

        assert_eq!(settings.steam_username, "anonymous");
        assert_eq!(settings.build_id, None);
    }

    #[test]
    fn test_arguments_reach_settings() {
        let args = Args::parse_from([
            "dehumidifier",
            "--game",
            "Game",
            "--build",
            "14003218",
            "--steam-username",
            "someone",
            "--nuget-api-key",
            "",
            "--root",
            "/repo",
        ]);
        let settings = args.settings();

        assert_eq!(settings.build_id, Some(14003218));
        assert_eq!(settings.steam_username, "someone");
        assert_eq!(settings.nuget_api_key, None);
        assert_eq!(settings.game_directory(), "/repo/Games/Game");
    }
}
