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

//! SPI device and `Sx126xInterfaceVariant` glue for the STM32WL55's
//! integrated sub-GHz radio. The WL55 wires the SX126x die directly to the
//! MCU core over a dedicated SUBGHZSPI peripheral instead of a regular GPIO
//! SPI bus, so busy/NSS/IRQ handling goes through `embassy_stm32::subghz`
//! rather than external pins.

use embassy_stm32::gpio::Output;
use embassy_stm32::interrupt;
use embassy_stm32::peripherals::SUBGHZSPI;
use embassy_stm32::spi::Spi;
use embassy_sync::waitqueue::AtomicWaker;
use embedded_hal_async::spi::{ErrorType as SpiErrorType, SpiDevice};
use lora_phy::mod_params::RadioError;
use lora_phy::sx126x::Sx126xInterfaceVariant;

static RADIO_WAKER: AtomicWaker = AtomicWaker::new();

/// Fires on `SUBGHZ_RADIO`, the single interrupt line the sub-GHz radio
/// shares with NSS/busy/IRQ status on the WL55.
pub struct InterruptHandler;

impl interrupt::typelevel::Handler<interrupt::typelevel::SUBGHZ_RADIO> for InterruptHandler {
    unsafe fn on_interrupt() {
        interrupt::SUBGHZ_RADIO.disable();
        RADIO_WAKER.wake();
    }
}

/// Newtype around the SUBGHZSPI peripheral so this crate -- not
/// `embassy-stm32` or `embedded-hal-async` -- owns the `SpiDevice` impl
/// (orphan rules forbid implementing a foreign trait for a foreign type
/// directly).
pub struct SubghzSpiDevice<'d>(pub Spi<'d, SUBGHZSPI>);

impl<'d> SpiErrorType for SubghzSpiDevice<'d> {
    type Error = embassy_stm32::spi::Error;
}

impl<'d> SpiDevice for SubghzSpiDevice<'d> {
    async fn transaction(
        &mut self,
        operations: &mut [embedded_hal_async::spi::Operation<'_, u8>],
    ) -> Result<(), Self::Error> {
        use embedded_hal_async::spi::Operation;
        for op in operations {
            match op {
                Operation::Read(buf) => self.0.read(buf).await?,
                Operation::Write(buf) => self.0.write(buf).await?,
                Operation::Transfer(read, write) => self.0.transfer(read, write).await?,
                Operation::TransferInPlace(buf) => self.0.transfer_in_place(buf).await?,
                Operation::DelayNs(_) => {}
            }
        }
        Ok(())
    }
}

/// RF switch control: the Nucleo-WL55JC board routes TX/RX through a
/// front-end switch on an ordinary GPIO rather than the radio itself.
pub struct Stm32wlInterfaceVariant<'d> {
    rf_switch_rx: Option<Output<'d>>,
    rf_switch_tx: Option<Output<'d>>,
}

impl<'d> Stm32wlInterfaceVariant<'d> {
    pub fn new(
        _irqs: impl embassy_stm32::interrupt::typelevel::Binding<interrupt::typelevel::SUBGHZ_RADIO, InterruptHandler> + 'd,
        rf_switch_rx: Option<Output<'d>>,
        rf_switch_tx: Option<Output<'d>>,
    ) -> Result<Self, RadioError> {
        interrupt::SUBGHZ_RADIO.unpend();
        unsafe { interrupt::SUBGHZ_RADIO.enable() };
        Ok(Self {
            rf_switch_rx,
            rf_switch_tx,
        })
    }
}

impl<'d> Sx126xInterfaceVariant for Stm32wlInterfaceVariant<'d> {
    async fn reset(&mut self, _delay: &mut impl embedded_hal_async::delay::DelayNs) -> Result<(), RadioError> {
        // The WL55's radio core resets along with the MCU core; there is no
        // discrete NRESET line to drive.
        Ok(())
    }

    async fn wait_on_busy(&mut self) -> Result<(), RadioError> {
        core::future::poll_fn(|cx| {
            RADIO_WAKER.register(cx.waker());
            if embassy_stm32::pac::PWR.sr2().read().rfbusys() {
                interrupt::SUBGHZ_RADIO.unpend();
                unsafe { interrupt::SUBGHZ_RADIO.enable() };
                core::task::Poll::Pending
            } else {
                core::task::Poll::Ready(())
            }
        })
        .await;
        Ok(())
    }

    async fn await_irq(&mut self) -> Result<(), RadioError> {
        core::future::poll_fn(|cx| {
            RADIO_WAKER.register(cx.waker());
            interrupt::SUBGHZ_RADIO.unpend();
            unsafe { interrupt::SUBGHZ_RADIO.enable() };
            core::task::Poll::Ready(())
        })
        .await;
        Ok(())
    }

    async fn enable_rf_switch_rx(&mut self) -> Result<(), RadioError> {
        if let Some(rx) = self.rf_switch_rx.as_mut() {
            rx.set_high();
        }
        if let Some(tx) = self.rf_switch_tx.as_mut() {
            tx.set_low();
        }
        Ok(())
    }

    async fn enable_rf_switch_tx(&mut self) -> Result<(), RadioError> {
        if let Some(tx) = self.rf_switch_tx.as_mut() {
            tx.set_high();
        }
        if let Some(rx) = self.rf_switch_rx.as_mut() {
            rx.set_low();
        }
        Ok(())
    }

    async fn disable_rf_switch(&mut self) -> Result<(), RadioError> {
        if let Some(rx) = self.rf_switch_rx.as_mut() {
            rx.set_low();
        }
        if let Some(tx) = self.rf_switch_tx.as_mut() {
            tx.set_low();
        }
        Ok(())
    }
}
