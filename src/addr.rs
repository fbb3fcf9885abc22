// TCP reactor server framework.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::fmt::{self, Display, Formatter};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};

/// IPv4 endpoint address, convertible to and from the kernel
/// [`libc::sockaddr_in`] representation used by the socket syscalls.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
}

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self { Address { ip, port } }

    pub fn ip(&self) -> Ipv4Addr { self.ip }

    pub fn port(&self) -> u16 { self.port }

    /// Kernel representation with fields in network byte order.
    pub(crate) fn to_sockaddr(self) -> libc::sockaddr_in {
        // Zero-init covers the padding and the BSD `sin_len` field.
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = self.port.to_be();
        sin.sin_addr.s_addr = u32::from(self.ip).to_be();
        sin
    }

    pub(crate) fn from_sockaddr(sin: &libc::sockaddr_in) -> Self {
        Address {
            ip: Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
            port: u16::from_be(sin.sin_port),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self { Address::new(*addr.ip(), addr.port()) }
}

impl From<Address> for SocketAddrV4 {
    fn from(addr: Address) -> Self { SocketAddrV4::new(addr.ip, addr.port) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sockaddr_roundtrip() {
        let addr = Address::new(Ipv4Addr::new(192, 168, 1, 17), 8888);
        let sin = addr.to_sockaddr();
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(Address::from_sockaddr(&sin), addr);
    }

    #[test]
    fn display() {
        let addr = Address::new(Ipv4Addr::LOCALHOST, 80);
        assert_eq!(addr.to_string(), "127.0.0.1:80");
    }

    #[test]
    fn std_conversions() {
        let std_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1234);
        let addr = Address::from(std_addr);
        assert_eq!(SocketAddrV4::from(addr), std_addr);
    }
}
