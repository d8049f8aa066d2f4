//! In this example, we bring up a simulated board with one hybrid of four CBC3s: configure it,
//! let the firmware tune the lines, then read a hundred events through the handshake.
//!
//! Run with `RUST_LOG=fc7ctl=debug` to watch every step.

use anyhow::Context;
use fc7ctl::{
    blocks::codec::{
        reply_word,
        SlaveMap,
        SlaveTableCodec,
    },
    prelude::*,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TOPOLOGY: &str = r#"
[[groups]]
link = 0

[[groups.hybrids]]
id = 0
chips = [
    { id = 0, kind = "Cbc3" },
    { id = 1, kind = "Cbc3" },
    { id = 2, kind = "Cbc3" },
    { id = 3, kind = "Cbc3" },
]
"#;

const SETTINGS: &str = r#"
[clock]
mgt = "Mhz160"

[trigger]
rate_khz = 50
"#;

/// Header plus eleven words per CBC3
const EVENT_WORDS: u32 = 4 + 11 * 4;

const WORDS: &str = "fc7_daq_stat.readout_block.general.words_cnt";
const TRIGGER_IN: &str = "fc7_daq_stat.fast_command_block.trigger_in_counter";
const REQUEST: &str = "fc7_daq_stat.readout_block.general.readout_req";
const FIFO: &str = "fc7_daq_ctrl.readout_block.readout_fifo";

/// A board that answers the way real CBC3 firmware would
fn simulated_board() -> Mock {
    let mut mock = Mock::new();
    for (name, value) in [
        ("fc7_daq_stat.general.info.chip_type", FrontEndType::Cbc3.code()),
        ("fc7_daq_stat.general.info.num_hybrids", 1),
        ("fc7_daq_stat.general.info.num_chips", 4),
        ("fc7_daq_stat.general.info.implementation", 1),
        ("fc7_daq_stat.command_processor_block.i2c.master_version", 1),
        ("fc7_daq_stat.physical_interface_block.hardware_ready", 1),
    ] {
        mock.set(name, value);
    }
    mock.on_write("sysreg.ctrl.cdce_sync", |state, v| {
        state.set("fc7_daq_stat.general.clock_generator.clk_40_locked", v);
        state.set("fc7_daq_stat.general.clock_generator.ref_clk_locked", v);
    });

    // Every chip answers its register reads
    let codec = SlaveTableCodec::new(SlaveMap::for_front_end(FrontEndType::Cbc3, 4));
    mock.on_write_block(
        "fc7_daq_ctrl.command_processor_block.i2c.command_fifo",
        move |state, words| {
            let replies: Vec<u32> = codec
                .decode_all(words)
                .unwrap_or_default()
                .iter()
                .filter(|t| t.read_back)
                .map(|t| reply_word(codec.encoding(), t, false))
                .collect();
            state.push_block("fc7_daq_ctrl.command_processor_block.i2c.reply_fifo", &replies);
            state.set(
                "fc7_daq_stat.command_processor_block.i2c.nreplies",
                u32::try_from(replies.len()).unwrap_or(u32::MAX),
            );
        },
    );

    // Starting the trigger FSM delivers every accepted trigger at once
    mock.on_write("fc7_daq_ctrl.fast_command_block.control.start_trigger", |state, v| {
        if v != 1 {
            return;
        }
        let triggers = state
            .get("fc7_daq_cnfg.fast_command_block.triggers_to_accept")
            .max(1);
        for event in 0..triggers {
            let mut words = vec![event; EVENT_WORDS as usize];
            words[0] = 0xFFFF_0000 | (EVENT_WORDS / 4);
            state.push_block(FIFO, &words);
        }
        state.set(WORDS, triggers * EVENT_WORDS);
        state.set(TRIGGER_IN, triggers);
        state.set(REQUEST, 1);
    });
    mock.on_write("fc7_daq_ctrl.readout_block.control.readout_reset", |state, v| {
        if v == 1 {
            state.blocks.remove(FIFO);
            for name in [WORDS, TRIGGER_IN, REQUEST] {
                state.set(name, 0);
            }
        }
    });
    mock
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let topology: Topology = toml::from_str(TOPOLOGY).context("Parsing the topology")?;
    let settings = Settings::from_toml_str(SETTINGS)?;

    let mut board = Fc7::new(simulated_board());
    let info = board
        .configure(topology, &settings)
        .context("Configuring the board")?;
    info!(?info, "Configured");
    info!(enables = ?board.enables(), "Chips enabled");

    let report = board.train().context("Training the links")?;
    info!(?report, "Trained");

    let words = board.read_exactly(100).context("Reading events")?;
    let frames = carve(&words)?;
    println!("Read {} events in {} words", frames.len(), words.len());
    for frame in frames.iter().take(3) {
        println!("  event at word {}: {:#010x?}", frame.offset, &frame.words[..4]);
    }

    let idle = board.stop()?;
    println!("Trigger FSM idle after stop: {idle}");
    Ok(())
}
