use copart_util::*;

lazy_static::lazy_static! {
    static ref ARGS_STR: String = format!(
        "-c, --config=<FILE>        'Pathname of the yaml config file'
             --config-override=[YAML] 'Inline yaml overlay merged over the config file'
         -o, --output=[FILE]        'Pathname for per-interval output (default: stdout)'
             --fin-output=[FILE]    'Pathname for until-completion output (default: stdout after the run)'
             --total-output=[FILE]  'Pathname for total output (default: stdout after the run)'
             --times-output=[FILE]  'Pathname for per-CPU time-category output (default: stdout)'
             --rundir=[DIR]         'Directory the per-task run directories are created under (default: {dfl_rundir})'
             --id=[ID]              'Identifier for the experiment (default: random)'
             --ti=[SECS]            'Duration in seconds of the sampling interval'
             --mi=[NR]              'Maximum number of intervals'
         -e, --event=[EVENTS]...    'Comma-separated perf event group, may be given multiple times'
             --cpu-affinity=[CPU]... 'CPUs the controller itself (not the workloads) is allowed on'
             --clog-min=[SEV]       'Minimum severity logged to the console (default: {dfl_sev})'
             --flog-min=[SEV]       'Minimum severity logged to the log file (default: {dfl_sev})'
             --log-file=[FILE]      'File used for the general application log (default: {dfl_log})'
             --monitor-only         'Only monitor the configured workloads, do not drive them'",
        dfl_rundir = Args::default().rundir,
        dfl_sev = Args::default().clog_min,
        dfl_log = Args::default().log_file,
    );
}

#[derive(Debug, Clone)]
pub struct Args {
    pub config: String,
    pub config_override: String,
    pub output: String,
    pub fin_output: String,
    pub total_output: String,
    pub times_output: String,
    pub rundir: String,
    pub id: String,
    pub ti: Option<f64>,
    pub mi: Option<u32>,
    pub events: Vec<String>,
    pub cpu_affinity: Vec<u32>,
    pub clog_min: String,
    pub flog_min: String,
    pub log_file: String,
    pub monitor_only: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: String::new(),
            config_override: String::new(),
            output: String::new(),
            fin_output: String::new(),
            total_output: String::new(),
            times_output: String::new(),
            rundir: "run".into(),
            id: String::new(),
            ti: None,
            mi: None,
            events: vec![],
            cpu_affinity: vec![],
            clog_min: "inf".into(),
            flog_min: "inf".into(),
            log_file: "copart.log".into(),
            monitor_only: false,
        }
    }
}

impl Args {
    pub fn parse() -> Args {
        let matches = clap::App::new("copart-agent")
            .version(clap::crate_version!())
            .about("Experiment controller for co-located workloads under Intel RDT partitioning")
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches();

        let mut args = Args::default();
        let dfl = Args::default();

        args.config = matches.value_of("config").unwrap().to_string();
        args.config_override = matches
            .value_of("config-override")
            .unwrap_or("")
            .to_string();
        args.output = matches.value_of("output").unwrap_or("").to_string();
        args.fin_output = matches.value_of("fin-output").unwrap_or("").to_string();
        args.total_output = matches.value_of("total-output").unwrap_or("").to_string();
        args.times_output = matches.value_of("times-output").unwrap_or("").to_string();
        args.rundir = matches
            .value_of("rundir")
            .filter(|v| !v.is_empty())
            .unwrap_or(&dfl.rundir)
            .to_string();
        args.id = match matches.value_of("id") {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => random_string(10),
        };
        args.ti = matches
            .value_of("ti")
            .map(|v| v.parse().expect("failed to parse \"ti\""));
        args.mi = matches
            .value_of("mi")
            .map(|v| v.parse().expect("failed to parse \"mi\""));
        if let Some(events) = matches.values_of("event") {
            args.events = events.map(|x| x.to_string()).collect();
        }
        if let Some(cpus) = matches.values_of("cpu-affinity") {
            args.cpu_affinity = cpus
                .map(|x| x.parse().expect("failed to parse \"cpu-affinity\""))
                .collect();
        }
        args.clog_min = matches
            .value_of("clog-min")
            .filter(|v| !v.is_empty())
            .unwrap_or(&dfl.clog_min)
            .to_string();
        args.flog_min = matches
            .value_of("flog-min")
            .filter(|v| !v.is_empty())
            .unwrap_or(&dfl.flog_min)
            .to_string();
        args.log_file = matches
            .value_of("log-file")
            .unwrap_or(&dfl.log_file)
            .to_string();
        args.monitor_only = matches.is_present("monitor-only");

        args
    }
}
