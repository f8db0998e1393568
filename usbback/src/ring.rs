// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend-side cursors over a shared ring page.
//!
//! The frontend owns `req_prod`, the backend owns `rsp_prod`. Both are free
//! running. The backend keeps its private request consumer and response
//! producer here; only `rsp_prod` is published back to the shared page.

use std::sync::atomic::{Ordering, fence};

use log::error;
use thiserror::Error;
use vm_memory::{Bytes, VolatileMemoryError, VolatileSlice};

use crate::protocol::{
    REQ_PROD_OFFSET, RING_HEADER_SIZE, RING_SIZE, RING_SLOT_SIZE, RSP_PROD_OFFSET, UrbRequest,
    UrbResponse, slot_offset,
};

#[derive(Error, Debug)]
pub enum RingError {
    #[error("Ring page too small: {0} bytes")]
    PageTooSmall(usize),
    #[error("Ring page access failed: {0}")]
    Volatile(#[from] VolatileMemoryError),
}

/// Private backend cursors. The shared page itself is borrowed per call so
/// the mapping can live with the device that owns it.
#[derive(Debug, Default)]
pub struct BackRing {
    req_cons: u32,
    rsp_prod: u32,
}

impl BackRing {
    pub fn new() -> Self {
        BackRing::default()
    }

    /// Number of requests published by the frontend and not yet consumed.
    ///
    /// A frontend running the producer more than a full ring ahead of the
    /// consumer is violating the protocol; the overrun is clamped so the
    /// backend only ever reads slots the index range can address.
    pub fn unconsumed_requests(&self, page: &VolatileSlice) -> Result<u32, RingError> {
        check_page(page)?;
        let req_prod: u32 = page.read_obj(REQ_PROD_OFFSET)?;
        fence(Ordering::Acquire);
        let outstanding = req_prod.wrapping_sub(self.req_cons);
        if outstanding > RING_SIZE {
            error!("Ring producer overrun: {outstanding} outstanding requests, clamping");
            return Ok(RING_SIZE);
        }
        Ok(outstanding)
    }

    /// Pops the next request off the ring, if the frontend has published one.
    pub fn next_request(&mut self, page: &VolatileSlice) -> Result<Option<UrbRequest>, RingError> {
        if self.unconsumed_requests(page)? == 0 {
            return Ok(None);
        }
        let req: UrbRequest = page.read_obj(slot_offset(self.req_cons))?;
        self.req_cons = self.req_cons.wrapping_add(1);
        Ok(Some(req))
    }

    /// Writes a response into the next free slot and publishes it.
    pub fn push_response(
        &mut self,
        page: &VolatileSlice,
        rsp: &UrbResponse,
    ) -> Result<(), RingError> {
        check_page(page)?;
        page.write_obj(*rsp, slot_offset(self.rsp_prod))?;
        self.rsp_prod = self.rsp_prod.wrapping_add(1);
        fence(Ordering::Release);
        page.write_obj(self.rsp_prod, RSP_PROD_OFFSET)?;
        Ok(())
    }

    pub fn rsp_prod(&self) -> u32 {
        self.rsp_prod
    }

    pub fn req_cons(&self) -> u32 {
        self.req_cons
    }
}

fn check_page(page: &VolatileSlice) -> Result<(), RingError> {
    let needed = RING_HEADER_SIZE + RING_SIZE as usize * RING_SLOT_SIZE;
    if page.len() < needed {
        return Err(RingError::PageTooSmall(page.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::SharedPage;
    use crate::protocol::{RequestType, UrbStatus};

    fn publish_request(page: &VolatileSlice, idx: u32, req: &UrbRequest) {
        page.write_obj(*req, slot_offset(idx)).unwrap();
        page.write_obj(idx.wrapping_add(1), REQ_PROD_OFFSET).unwrap();
    }

    #[test]
    fn test_empty_ring() {
        let shared = SharedPage::new();
        let page = shared.slice();
        let mut ring = BackRing::new();
        assert_eq!(ring.unconsumed_requests(&page).unwrap(), 0);
        assert!(ring.next_request(&page).unwrap().is_none());
    }

    #[test]
    fn test_consume_in_order() {
        let shared = SharedPage::new();
        let page = shared.slice();
        let mut ring = BackRing::new();
        publish_request(&page, 0, &UrbRequest::simple(100, RequestType::Reset));
        publish_request(&page, 1, &UrbRequest::simple(101, RequestType::GetSpeed));
        assert_eq!(ring.unconsumed_requests(&page).unwrap(), 2);
        assert_eq!(ring.next_request(&page).unwrap().unwrap().id, 100);
        assert_eq!(ring.next_request(&page).unwrap().unwrap().id, 101);
        assert!(ring.next_request(&page).unwrap().is_none());
    }

    #[test]
    fn test_response_published_to_shared_page() {
        let shared = SharedPage::new();
        let page = shared.slice();
        let mut ring = BackRing::new();
        ring.push_response(&page, &UrbResponse::new(7, 0, 0, UrbStatus::Okay))
            .unwrap();
        let rsp: UrbResponse = page.read_obj(slot_offset(0)).unwrap();
        assert_eq!(rsp.id, 7);
        let rsp_prod: u32 = page.read_obj(RSP_PROD_OFFSET).unwrap();
        assert_eq!(rsp_prod, 1);
        assert_eq!(ring.rsp_prod(), 1);
    }

    #[test]
    fn test_indices_wrap_across_ring_boundary() {
        let shared = SharedPage::new();
        let page = shared.slice();
        let mut ring = BackRing::new();
        for i in 0..40u32 {
            publish_request(&page, i, &UrbRequest::simple(u64::from(i), RequestType::Reset));
            let req = ring.next_request(&page).unwrap().unwrap();
            assert_eq!(req.id, u64::from(i));
            ring.push_response(&page, &UrbResponse::new(req.id, 0, 0, UrbStatus::Okay))
                .unwrap();
        }
        // The response for index 39 reused slot 39 & 31 = 7.
        let rsp: UrbResponse = page.read_obj(slot_offset(39)).unwrap();
        assert_eq!(rsp.id, 39);
        assert_eq!(ring.req_cons(), 40);
        assert_eq!(ring.rsp_prod(), 40);
    }

    #[test]
    fn test_producer_overrun_clamped() {
        let shared = SharedPage::new();
        let page = shared.slice();
        let ring = BackRing::new();
        page.write_obj(1000u32, REQ_PROD_OFFSET).unwrap();
        assert_eq!(ring.unconsumed_requests(&page).unwrap(), RING_SIZE);
    }

    #[test]
    fn test_short_page_rejected() {
        let shared = SharedPage::new();
        let page = shared.slice();
        let short = page.subslice(0, 128).unwrap();
        let mut ring = BackRing::new();
        assert!(matches!(
            ring.next_request(&short),
            Err(RingError::PageTooSmall(128))
        ));
    }
}
