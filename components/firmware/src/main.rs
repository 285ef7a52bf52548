//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

#![no_std]
#![no_main]

#[cfg(feature = "log-rtt")]
use defmt_rtt as _;

#[cfg(feature = "log-serial")]
use defmt_serial as _;

use embassy_executor::Spawner;
use panic_probe as _;

mod iv;

#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
use embassy_futures::block_on;
use embassy_stm32::flash::{Flash, BANK1_REGION};
use embassy_stm32::rng::{self, Rng};
use embassy_stm32::{bind_interrupts, gpio, peripherals, spi::Spi, time};
use embassy_time::{Delay, Duration, Instant, Timer};
use lora_modulation::BaseBandModulationParams;
use lora_phy::{
    mod_params::{Bandwidth, CodingRate, ModulationParams, PacketParams, SpreadingFactor, *},
    mod_traits::RadioKind,
    sx126x::{self, Stm32wl, Sx126x},
    LoRa, RxMode,
};

use seel_api::{AssertionHook, CbInfo, GNodeCallbacks, LowPower, NodeId, Nvm, RadioPhy, Rssi, SNodeCallbacks, TimeMs};
use seel_core::assert::NvmAssertionLog;
use seel_core::config::SeelConfig;
use seel_core::gnode::{GNode, GNodeTask};
use seel_core::scheduler::{Clock, Scheduler};
use seel_core::snode::{SNode, SNodeTask};

// for log-serial
#[allow(unused_imports)]
use embassy_stm32::{
    dma::NoDma,
    usart::{self, Uart},
};
#[cfg(feature = "log-serial")]
use static_cell::StaticCell;

/// The first 32bits of the UID64 is a unique (among stm32wl5x devices) device
/// number; used to seed `unique_key` so ID_CHECK collisions between two
/// nodes that both requested the same id resolve deterministically (spec §4.6.1).
const DEVNUM_PTR: *const u32 = 0x1FFF_7580 as *const u32;

const DATA_SIZE: usize = 24;
const MAX_NODES: usize = 64;
const DUP_WINDOW: usize = 8;
const DIAG_DEPTH: usize = 4;
const SCHED_CAP: usize = 16;
const MAX_MESSAGE_SIZE: usize = 64;

const ASSERTION_LOG_ENTRIES: usize = 32;
/// Last flash sector of bank 1 is reserved for the assertion ring; nothing
/// else on this target writes there.
const ASSERTION_LOG_BASE_ADDR: usize = 0x0803_F800;

const LORA_SPREADING_FACTOR: SpreadingFactor = SpreadingFactor::_9;
const LORA_BANDWIDTH: Bandwidth = Bandwidth::_125KHz;
const LORA_CODING_RATE: CodingRate = CodingRate::_4_5;
const LORA_PREAMBLE_LEN: u16 = 12;
const LORA_IMPLICIT_HEADER: bool = false;
const LORA_CRC_ON: bool = true;
const LORA_IQ_INVERTED: bool = false;
/// Output power in dBm [-17, 22]
const LORA_OUTPUT_POWER: i32 = 14;
const LORA_RX_BOOST: bool = false;
const LORA_USE_HIGH_POWER_PA: bool = false;
const LORA_FREQUENCY_HZ: u32 = 868_100_000;
/// How long one non-blocking `parse_packet` poll waits for a frame before
/// giving up; approximates a hardware IRQ-status poll on top of `lora-phy`'s
/// timeout-based receive API.
const POLL_WINDOW: Duration = Duration::from_millis(20);

/// Required for calculating time on air.
#[allow(dead_code)]
const LORA_PARAMS: BaseBandModulationParams =
    BaseBandModulationParams::new(LORA_SPREADING_FACTOR, LORA_BANDWIDTH, LORA_CODING_RATE);

bind_interrupts!(struct Irqs{
    SUBGHZ_RADIO => iv::InterruptHandler;
    // for log-serial
    USART1 => usart::InterruptHandler<peripherals::USART1>;
    RNG => rng::InterruptHandler<peripherals::RNG>;
});

/// Monotonic clock the scheduler reads, rebased on beacon sync
/// (`adjust_time`) or ms-counter overflow (`zero_millis_timer`) by adding an
/// offset to the hardware timer rather than rewriting it.
struct EmbassyClock {
    offset_ms: i64,
}

impl EmbassyClock {
    fn new() -> Self {
        Self { offset_ms: 0 }
    }
}

impl Clock for EmbassyClock {
    fn now_ms(&self) -> TimeMs {
        ((Instant::now().as_millis() as i64) + self.offset_ms) as TimeMs
    }

    fn set_now_ms(&mut self, new_ms: TimeMs) {
        let raw = Instant::now().as_millis() as i64;
        self.offset_ms = new_ms as i64 - raw;
    }
}

type RadioDriver<'d> = LoRa<Sx126x<iv::SubghzSpiDevice<'d>, iv::Stm32wlInterfaceVariant<'d>>, Delay>;

/// Adapts the async `lora-phy` driver to `seel_api::RadioPhy`'s blocking
/// contract (send blocks for time-on-air, `parse_packet` is a short,
/// non-blocking-ish poll) the way the protocol engine expects on real
/// hardware.
struct Stm32RadioPhy<'d> {
    lora: RadioDriver<'d>,
    tx_pkt_params: PacketParams,
    rx_pkt_params: PacketParams,
    modulation_params: ModulationParams,
    receive_buffer: [u8; MAX_MESSAGE_SIZE],
    last_rssi: Rssi,
    last_snr: f32,
    pending_len: Option<usize>,
}

impl<'d> Stm32RadioPhy<'d> {
    fn new(lora: RadioDriver<'d>) -> Self {
        let modulation_params = lora
            .create_modulation_params(LORA_SPREADING_FACTOR, LORA_BANDWIDTH, LORA_CODING_RATE, LORA_FREQUENCY_HZ)
            .unwrap();
        let tx_pkt_params = lora
            .create_tx_packet_params(LORA_PREAMBLE_LEN, LORA_IMPLICIT_HEADER, LORA_CRC_ON, LORA_IQ_INVERTED, &modulation_params)
            .unwrap();
        let rx_pkt_params = lora
            .create_rx_packet_params(
                LORA_PREAMBLE_LEN,
                LORA_IMPLICIT_HEADER,
                MAX_MESSAGE_SIZE as u8,
                LORA_CRC_ON,
                LORA_IQ_INVERTED,
                &modulation_params,
            )
            .unwrap();
        Self {
            lora,
            tx_pkt_params,
            rx_pkt_params,
            modulation_params,
            receive_buffer: [0u8; MAX_MESSAGE_SIZE],
            last_rssi: 0,
            last_snr: 0.0,
            pending_len: None,
        }
    }
}

impl<'d> RadioPhy for Stm32RadioPhy<'d> {
    type Error = RadioError;

    fn begin(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn set_spreading_factor(&mut self, _sf: u8) -> Result<(), RadioError> {
        Ok(())
    }
    fn set_bandwidth_khz(&mut self, _bandwidth_khz: u32) -> Result<(), RadioError> {
        Ok(())
    }
    fn set_tx_power_dbm(&mut self, _power_dbm: i8) -> Result<(), RadioError> {
        Ok(())
    }
    fn set_coding_rate(&mut self, _denominator: u8) -> Result<(), RadioError> {
        Ok(())
    }
    fn set_crc(&mut self, _enabled: bool) -> Result<(), RadioError> {
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        block_on(async {
            self.lora
                .prepare_for_tx(&self.modulation_params, &mut self.tx_pkt_params, LORA_OUTPUT_POWER, bytes)
                .await?;
            self.lora.tx().await
        })
    }

    fn parse_packet(&mut self) -> Result<Option<usize>, RadioError> {
        block_on(async {
            self.lora
                .prepare_for_rx(RxMode::Single(POLL_WINDOW.as_millis() as u16), &self.modulation_params, &self.rx_pkt_params)
                .await?;
            match embassy_time::with_timeout(POLL_WINDOW, self.lora.rx(&self.rx_pkt_params, &mut self.receive_buffer)).await {
                Ok(Ok((len, status))) => {
                    self.last_rssi = status.rssi as Rssi;
                    self.last_snr = status.snr as f32;
                    self.pending_len = Some(len as usize);
                    Ok(Some(len as usize))
                }
                Ok(Err(_)) | Err(_) => Ok(None),
            }
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        let Some(len) = self.pending_len.take() else {
            return Ok(0);
        };
        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&self.receive_buffer[..n]);
        Ok(n)
    }

    fn packet_rssi(&self) -> Rssi {
        self.last_rssi
    }

    fn packet_snr(&self) -> f32 {
        self.last_snr
    }

    fn packet_crc_ok(&self) -> bool {
        true
    }

    fn sleep(&mut self) -> Result<(), RadioError> {
        block_on(self.lora.sleep(false))
    }
}

/// `Tick` is one nominal watchdog period in milliseconds; `power_down`
/// blocks on an `embassy_time::Timer` rather than entering an MCU STOP mode,
/// which a production firmware build would wire into RCC/PWR directly.
struct Stm32LowPower;

impl LowPower for Stm32LowPower {
    type Tick = TimeMs;

    fn power_down(&mut self, tick: TimeMs) {
        block_on(Timer::after_millis(tick as u64));
    }
}

/// Blocking flash-backed NVM. `update` is only called by `NvmAssertionLog`
/// after an erase, one ring entry at a time, so a whole-page read-modify-erase-write
/// per update is acceptable for a log that is written rarely (on assertion
/// failure only).
struct Stm32Nvm {
    flash: Flash<'static, BANK1_REGION>,
    base: usize,
    len: usize,
}

impl Nvm for Stm32Nvm {
    type Error = embassy_stm32::flash::Error;

    fn length(&self) -> usize {
        self.len
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.flash.blocking_read((self.base + addr) as u32, buf)
    }

    fn update(&mut self, addr: usize, buf: &[u8]) -> Result<(), Self::Error> {
        let mut current = [0u8; 4];
        self.flash.blocking_read((self.base + addr) as u32, &mut current)?;
        if current == buf {
            return Ok(());
        }
        self.flash.blocking_erase(self.base as u32, (self.base + self.len) as u32)?;
        self.flash.blocking_write((self.base + addr) as u32, buf)
    }
}

/// Persists assertion failures to flash so they survive a reset; the
/// `seel_assert!` macro only calls `record`, it never touches NVM itself.
struct Stm32AssertionHook {
    log: NvmAssertionLog<Stm32Nvm, ASSERTION_LOG_ENTRIES>,
}

impl AssertionHook for Stm32AssertionHook {
    fn record(&mut self, file: &'static str, line: u32) {
        error!("assertion failed at {}:{}", file, line);
        self.log.add(file, line);
    }
}

struct FirmwareCallbacks {
    uplink_counter: u16,
}

impl GNodeCallbacks for FirmwareCallbacks {
    fn on_broadcast(&mut self, _payload: &[u8]) {}

    fn on_data(&mut self, payload: &[u8], rssi: Rssi) {
        info!("data from child, rssi {}: {:?}", rssi, payload);
    }
}

impl SNodeCallbacks<DIAG_DEPTH> for FirmwareCallbacks {
    fn on_load(&mut self, payload: &mut [u8], _info: &CbInfo<DIAG_DEPTH>) -> bool {
        payload[0..2].copy_from_slice(&self.uplink_counter.to_be_bytes());
        self.uplink_counter = self.uplink_counter.wrapping_add(1);
        true
    }
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let mut config = embassy_stm32::Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hse = Some(Hse {
            freq: time::Hertz(32_000_000),
            mode: HseMode::Bypass,
            prescaler: HsePrescaler::DIV1,
        });
        config.rcc.mux = ClockSrc::PLL1_R;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSE,
            prediv: PllPreDiv::DIV2,
            mul: PllMul::MUL6,
            divp: None,
            divq: Some(PllQDiv::DIV2),
            divr: Some(PllRDiv::DIV2),
        });
    }
    let p = embassy_stm32::init(config);

    // GNODE/SNODE role pin, read early so it's stable.
    let role_pin = gpio::Input::new(p.PB3, gpio::Pull::Up);

    #[cfg(feature = "log-serial")]
    {
        let mut uart_config = usart::Config::default();
        uart_config.baudrate = 115200;
        static UART: StaticCell<Uart<'static, peripherals::USART1, peripherals::DMA2_CH1>> = StaticCell::new();
        let uart = UART.init(Uart::new(p.USART1, p.PB7, p.PB6, Irqs, p.DMA2_CH1, NoDma, uart_config).unwrap());
        defmt_serial::defmt_serial(uart);
    }

    // Nucleo rf switch
    let _rf_ctrl1 = gpio::Output::new(p.PC4, gpio::Level::High, gpio::Speed::High);
    let rf_ctrl2 = gpio::Output::new(p.PC5, gpio::Level::High, gpio::Speed::High);
    let _rf_ctrl3 = gpio::Output::new(p.PC3, gpio::Level::High, gpio::Speed::High);

    let lora_spi = Spi::new_subghz(p.SUBGHZSPI, p.DMA1_CH1, p.DMA1_CH2);
    let lora_spi = iv::SubghzSpiDevice(lora_spi);

    let devnum = unsafe { DEVNUM_PTR.read() };

    let radio_config = sx126x::Config {
        chip: Stm32wl {
            use_high_power_pa: LORA_USE_HIGH_POWER_PA,
        },
        tcxo_ctrl: Some(sx126x::TcxoCtrlVoltage::Ctrl1V7),
        use_dcdc: true,
        rx_boost: LORA_RX_BOOST,
    };
    let variant = iv::Stm32wlInterfaceVariant::new(Irqs, None, Some(rf_ctrl2)).unwrap();
    let lora = LoRa::new(Sx126x::new(lora_spi, variant, radio_config), false, Delay).await.unwrap();
    let mut radio = Stm32RadioPhy::new(lora);
    let _ = radio.begin();

    let mut rng = Rng::new(p.RNG, Irqs);

    let config = SeelConfig::default();
    let clock = EmbassyClock::new();
    let mut low_power = Stm32LowPower;

    let flash = Flash::new_blocking(p.FLASH).into_blocking_regions().bank1_region;
    let assertion_nvm = Stm32Nvm {
        flash,
        base: ASSERTION_LOG_BASE_ADDR,
        len: ASSERTION_LOG_ENTRIES * 4,
    };
    let mut hook = Stm32AssertionHook {
        log: NvmAssertionLog::init(assertion_nvm, 0),
    };

    let mut cb = FirmwareCallbacks { uplink_counter: 0 };

    if role_pin.is_low() {
        info!("booting as GNODE");
        let mut node: GNode<MAX_NODES, DATA_SIZE, DUP_WINDOW> = GNode::new();
        let mut sched: Scheduler<EmbassyClock, GNodeTask, SCHED_CAP> = Scheduler::new(clock);
        sched.add_task(GNodeTask::Bcast, 0, false);
        sched.run(|sched, task| match task {
            GNodeTask::Bcast => node.bcast_task(sched, &mut radio, &mut cb, &config),
            GNodeTask::Receive => {
                node.receive_task(&mut radio, &mut cb, &mut hook, config.max_cycle_misses);
                node.send_ack_if_pending(&mut radio);
                sched.add_task(GNodeTask::Receive, 0, false);
            }
            GNodeTask::None => {}
        });
    } else {
        // Low 7 bits of the device number as the requested node id (never
        // 0, reserved for the GNODE); the full device number as the unique
        // key that breaks ID_CHECK collisions with another node requesting
        // the same id (spec §4.6.1, §8 scenario 2).
        let node_id: NodeId = ((devnum & 0x7F) as u8).max(1);
        info!("booting as SNODE, requested id {}", node_id);
        let mut node: SNode<MAX_NODES, DATA_SIZE, DUP_WINDOW, DIAG_DEPTH> = SNode::new(node_id, devnum, &config);
        let mut sched: Scheduler<EmbassyClock, SNodeTask, SCHED_CAP> = Scheduler::new(clock);
        sched.add_task(SNodeTask::Wake, 0, false);
        sched.run(|sched, task| match task {
            SNodeTask::Wake => node.wake_task(sched, &config),
            SNodeTask::Receive => node.receive_task(sched, &mut radio, &mut cb, &mut hook, &config, &mut rng),
            SNodeTask::Enqueue => node.enqueue_task(sched),
            SNodeTask::Send => node.send_task(sched, &mut radio, &mut cb, &config, &mut rng),
            SNodeTask::User => node.user_task(sched, &mut cb, 60_000),
            SNodeTask::Sleep => node.sleep_task(sched, &mut radio, &mut low_power, config.initial_wd_estimate_ms, &config),
            SNodeTask::ForceSleep => node.force_sleep_task(sched),
            SNodeTask::None => {}
        });
    }
}
// prevent panic messages from being printed twice when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
