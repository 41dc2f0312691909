// Copyright 2025 The Metalplane Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use metalplane_error::{Code, Error};
use metalplane_macro::metalplane_test;
use metalplane_store::ipam::{Ipam, MemoryIpam};
use metalplane_util::network::PrefixUsage;
use pretty_assertions::assert_eq;

#[metalplane_test]
async fn allocate_ip_skips_network_address() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    ipam.create_prefix("10.0.0.0/30").await?;

    assert_eq!(ipam.allocate_ip("10.0.0.0/30").await?, "10.0.0.1");
    assert_eq!(ipam.allocate_ip("10.0.0.0/30").await?, "10.0.0.2");
    assert_eq!(
        ipam.allocate_ip("10.0.0.0/30").await.unwrap_err().code,
        Code::ResourceExhausted
    );
    Ok(())
}

#[metalplane_test]
async fn prefix_with_host_bits_is_rejected() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    assert_eq!(
        ipam.create_prefix("10.0.0.1/24").await.unwrap_err().code,
        Code::InvalidArgument
    );
    Ok(())
}

#[metalplane_test]
async fn allocate_specific_ip_twice_fails() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    ipam.create_prefix("10.0.0.0/24").await?;

    ipam.allocate_specific_ip("10.0.0.0/24", "10.0.0.42").await?;
    let err = ipam
        .allocate_specific_ip("10.0.0.0/24", "10.0.0.42")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::AlreadyExists);

    let err = ipam
        .allocate_specific_ip("10.0.0.0/24", "10.0.1.1")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    Ok(())
}

#[metalplane_test]
async fn release_ip_makes_address_available_again() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    ipam.create_prefix("10.0.0.0/24").await?;
    let ip = ipam.allocate_ip("10.0.0.0/24").await?;

    ipam.release_ip(&ip).await?;
    assert_eq!(ipam.release_ip(&ip).await.unwrap_err().code, Code::NotFound);
    assert_eq!(ipam.allocate_ip("10.0.0.0/24").await?, ip);
    Ok(())
}

#[metalplane_test]
async fn child_prefixes_do_not_overlap() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    ipam.create_prefix("10.0.0.0/8").await?;

    let first = ipam.allocate_child_prefix("10.0.0.0/8", 22).await?;
    let second = ipam.allocate_child_prefix("10.0.0.0/8", 22).await?;
    assert_eq!(first, "10.0.0.0/22");
    assert_eq!(second, "10.0.4.0/22");

    // Addresses are allocated from the child, the parent skips over it.
    assert_eq!(ipam.allocate_ip(&first).await?, "10.0.0.1");
    assert_eq!(ipam.allocate_ip("10.0.0.0/8").await?, "10.0.8.0");

    ipam.release_child_prefix(&second).await?;
    assert_eq!(ipam.allocate_child_prefix("10.0.0.0/8", 22).await?, second);
    Ok(())
}

#[metalplane_test]
async fn prefix_with_allocations_cannot_be_deleted() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    ipam.create_prefix("10.0.0.0/8").await?;
    let child = ipam.allocate_child_prefix("10.0.0.0/8", 22).await?;
    let ip = ipam.allocate_ip(&child).await?;

    assert_eq!(
        ipam.release_child_prefix(&child).await.unwrap_err().code,
        Code::FailedPrecondition
    );
    assert_eq!(
        ipam.delete_prefix("10.0.0.0/8").await.unwrap_err().code,
        Code::FailedPrecondition
    );

    ipam.release_ip(&ip).await?;
    ipam.release_child_prefix(&child).await?;
    ipam.delete_prefix("10.0.0.0/8").await?;
    Ok(())
}

#[metalplane_test]
async fn prefix_usage_counts_addresses_and_children() -> Result<(), Error> {
    let ipam = MemoryIpam::new();
    ipam.create_prefix("10.0.0.0/24").await?;
    ipam.allocate_child_prefix("10.0.0.0/24", 26).await?;
    ipam.allocate_ip("10.0.0.0/24").await?;

    assert_eq!(
        ipam.prefix_usage("10.0.0.0/24").await?,
        PrefixUsage {
            available_ips: 253,
            used_ips: 1,
            available_prefixes: 3,
            used_prefixes: 1,
        }
    );
    Ok(())
}
